pub mod commands;
pub mod protocol;
pub mod status;

pub use commands::Command;
pub use protocol::*;
pub use status::{OtaSettings, ProfileCatalog, Status};
