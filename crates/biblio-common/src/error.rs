//! Error types shared across Biblio crates

use thiserror::Error;

/// Result type alias for Biblio operations
pub type Result<T> = std::result::Result<T, BiblioError>;

/// Main error type for Biblio
#[derive(Error, Debug)]
pub enum BiblioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl BiblioError {
    /// Shorthand for configuration errors built from a message
    pub fn config(message: impl Into<String>) -> Self {
        BiblioError::Config(message.into())
    }
}
