//! Error types for rssagg.

use thiserror::Error;

/// Common error type for rssagg.
#[derive(Error, Debug)]
pub enum RssaggError {
    /// Network failure, timeout, non-2xx status or oversized body.
    #[error("transport error: {0}")]
    Transport(String),

    /// The document could not be decoded as a syndication feed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persistence failure.
    ///
    /// Errors from sqlx are automatically converted. A duplicate item link
    /// is not reported through this variant.
    #[error("storage error: {0}")]
    Storage(String),

    /// Database connection or migration error.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),
}

impl RssaggError {
    /// Whether this error came from the fetch client.
    pub fn is_transport(&self) -> bool {
        matches!(self, RssaggError::Transport(_))
    }

    /// Whether this error came from the feed parser.
    pub fn is_parse(&self) -> bool {
        matches!(self, RssaggError::Parse(_))
    }

    /// Whether this error came from the item or source store.
    pub fn is_storage(&self) -> bool {
        matches!(self, RssaggError::Storage(_))
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for RssaggError {
    fn from(e: sqlx::Error) -> Self {
        RssaggError::Storage(e.to_string())
    }
}

/// Result type alias for rssagg operations.
pub type Result<T> = std::result::Result<T, RssaggError>;
