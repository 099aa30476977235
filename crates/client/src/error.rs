use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("timed out connecting to {url} after {after:?}")]
    ConnectTimeout { url: String, after: Duration },

    #[error("WebSocket not connected")]
    NotConnected,

    #[error("timed out writing to WebSocket after {after:?}")]
    WriteTimeout { after: Duration },

    #[error("failed to send message: {0}")]
    Send(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for `{request}` response after {after:?}")]
    Timeout { request: String, after: Duration },

    #[error("request `{0}` was aborted before a response arrived")]
    RequestAborted(String),

    #[error("invalid JSON message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no status data available to adjust temperature")]
    NoStatus,

    #[error("target temperature is unavailable")]
    TargetTemperatureUnavailable,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
