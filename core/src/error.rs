/// Error types for the realtime client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected (state: {0})")]
    NotConnected(String),

    #[error("No authentication credential available")]
    MissingCredential,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Failed to connect after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server error [{code}]: {message}")]
    Server { code: String, message: String },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown conversation: {0}")]
    UnknownThread(String),
}

impl RealtimeError {
    /// True for failures produced locally by the request timer
    pub fn is_timeout(&self) -> bool {
        matches!(self, RealtimeError::Timeout(_))
    }

    /// Server-supplied error code, if this error came from an `error` frame
    pub fn server_code(&self) -> Option<&str> {
        match self {
            RealtimeError::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
