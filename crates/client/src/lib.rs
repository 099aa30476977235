pub mod backoff;
pub mod config;
pub mod correlator;
pub mod device;
pub mod error;
pub mod history;
pub mod liveness;
pub mod router;
pub mod state;
pub mod transport;

pub use config::ClientConfig;
pub use device::Device;
pub use error::{Error, Result};
pub use history::{trim_history, HistoryStore, TrimReport};
pub use state::{ConnectionState, DeviceEvent};
