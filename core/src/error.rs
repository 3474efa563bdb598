/// Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Chat session is closed")]
    SessionClosed,
}

impl ChatError {
    /// Session expiry or rejected credentials. Never retried.
    pub fn is_auth(&self) -> bool {
        matches!(self, ChatError::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
