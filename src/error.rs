//! Unified error handling for the engine-on pipeline.
//!
//! Malformed readings never surface here: an unparseable voltage or
//! coordinate degrades to `Unknown`/NaN inside the classifier. Errors are
//! reserved for conditions that stop a date (`DateFailed`) or a whole run
//! (`UpstreamUnavailable`).

use thiserror::Error;

/// Unified error type for engine-on operations.
#[derive(Debug, Clone, Error)]
pub enum EngineOnError {
    /// Reference data (facilities) is empty or could not be read.
    /// Fatal for the whole scheduling run.
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },

    /// Processing of a single date failed. Recorded, never propagated to
    /// sibling dates.
    #[error("Date {date} failed: {message}")]
    DateFailed { date: String, message: String },

    /// A date string could not be parsed.
    #[error("Invalid date '{input}' (expected dd/mm/YYYY or YYYY-MM-DD)")]
    InvalidDate { input: String },

    /// Run configuration is inconsistent.
    #[error("Configuration error: {message}")]
    InvalidConfig { message: String },

    /// Persistence/storage error
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// JSON encode/decode error
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Local file could not be opened or read
    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Result type alias for engine-on operations.
pub type Result<T> = std::result::Result<T, EngineOnError>;

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for EngineOnError {
    fn from(e: rusqlite::Error) -> Self {
        EngineOnError::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineOnError {
    fn from(e: serde_json::Error) -> Self {
        EngineOnError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineOnError {
    fn from(e: std::io::Error) -> Self {
        EngineOnError::Io {
            message: e.to_string(),
        }
    }
}

/// Extension trait for converting Option to EngineOnError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an upstream-unavailable error.
    fn ok_or_upstream(self, message: &str) -> Result<T>;

    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_upstream(self, message: &str) -> Result<T> {
        self.ok_or_else(|| EngineOnError::UpstreamUnavailable {
            message: message.to_string(),
        })
    }

    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| EngineOnError::InvalidConfig {
            message: message.to_string(),
        })
    }
}
