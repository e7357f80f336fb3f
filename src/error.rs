//! Error types for the companion live engine

use thiserror::Error;

use crate::session::TransportError;

/// Result type alias for companion operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the companion live engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credential, model id, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Streaming transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session lifecycle misuse
    #[error("session error: {0}")]
    Session(String),

    /// Fallback conversation error
    #[error("fallback error: {0}")]
    Fallback(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
