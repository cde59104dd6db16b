use thiserror::Error;

/// Errors that can occur during daemon operation.
#[derive(Error, Debug)]
pub enum TandemError {
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Snapshot or gateway JSON encoding/decoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// A [`NotificationPort`](crate::notify::NotificationPort) call did not reach
/// its destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No adapter is connected to carry the message.
    #[error("no gateway connected")]
    Unavailable,
    /// The transport refused the message.
    #[error("rejected by transport: {0}")]
    Rejected(String),
}
