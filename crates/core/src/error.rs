use thiserror::Error;

/// Failures raised by the model stream and its transports.
///
/// Only these propagate out of the adapter; protocol-correctness issues are
/// logged and self-corrected instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Failed to open model stream: {0}")]
    Connect(String),

    #[error("Model stream transport error: {0}")]
    Transport(String),

    #[error("Failed to serialize model event: {0}")]
    Serialization(String),

    #[error("The model stream was closed")]
    Closed,

    #[error("The model stream is not active")]
    Inactive,
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}
