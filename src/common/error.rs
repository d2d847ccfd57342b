// Error types and error handling

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The server rejected the anti-forgery token (HTTP 403).
    #[error("Invalid or expired token")]
    Forbidden,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Could not obtain a token: {0}")]
    TokenUnavailable(String),

    #[error("Another upload is already in progress")]
    Busy,

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Chunk {index} failed after {attempts} attempts")]
    ChunkFailed { index: u32, attempts: u32 },

    #[error("Connection closed")]
    ConnectionClosed,
}

impl Error {
    /// True for the recognizable token rejection status.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DeserializationError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status == reqwest::StatusCode::FORBIDDEN => Error::Forbidden,
            Some(status) => Error::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Error::Http(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
