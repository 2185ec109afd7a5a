//! Error types for Rivulet
//!
//! Provides a unified error type hierarchy for the broker and its store adapters.

use thiserror::Error;

/// Result type alias using Rivulet's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Rivulet
#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("consumer for group {group} limit {limit} reached")]
    SlotLimitReached { group: String, limit: usize },

    // Store Errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Handler Errors
    #[error("Handler error: {0}")]
    Handler(String),

    // Codec Errors
    #[error("Codec error: {0}")]
    Codec(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stream store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("NOGROUP no such key '{stream}' or consumer group '{group}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("Invalid stream ID: {0}")]
    InvalidId(String),

    #[error("Operation against a key holding the wrong kind of value: {0}")]
    WrongType(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Whether this error is a configuration error that must never be retried
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::SlotLimitReached { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
