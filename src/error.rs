use thiserror::Error;

/// Result type for AHM operations
pub type Result<T> = std::result::Result<T, AhmError>;

/// Errors that can occur when talking to an AHM zone mixer
#[derive(Error, Debug)]
pub enum AhmError {
    /// Argument outside the bounds of the configured device model.
    /// Rejected before any byte is written.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Byte sequence that could not be framed or decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// No correlated response arrived within the request window
    #[error("Request timeout")]
    Timeout,

    /// Socket error or EOF on the control connection
    #[error("Connection lost")]
    ConnectionLost,

    /// No control connection is currently established
    #[error("Not connected")]
    NotConnected,

    /// Pending request was dropped by connection teardown
    #[error("Request cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl AhmError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AhmError::InvalidArgument(msg.into())
    }
}
