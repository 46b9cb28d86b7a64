//! # OfflineKit Common
//!
//! Shared building blocks for the OfflineKit crates.
//!
//! ## Features
//!
//! - Unified error type for configuration, storage and I/O failures
//! - Logging configuration and subscriber setup
//! - Retry and timeout utilities for registration attempts

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff_if, with_timeout, RetryConfig};

/// Unified error type for OfflineKit.
#[derive(Error, Debug)]
pub enum OfflineKitError {
    /// Configuration could not be loaded or is invalid.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Durable storage failed (marker store, data directory).
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl OfflineKitError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error with source.
    pub fn storage_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Short category name, used as a structured log field.
    pub fn category(&self) -> &'static str {
        match self {
            OfflineKitError::Config { .. } => "config",
            OfflineKitError::Storage { .. } => "storage",
            OfflineKitError::Io(_) => "io",
            OfflineKitError::Timeout(_) => "timeout",
            OfflineKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for OfflineKit operations.
pub type Result<T> = std::result::Result<T, OfflineKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap the error as a storage failure with context.
    fn storage_context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error as a config failure with context.
    fn config_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn storage_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OfflineKitError::storage_with_source(message, e))
    }

    fn config_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OfflineKitError::config_with_source(message, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(OfflineKitError::config("bad").category(), "config");
        assert_eq!(
            OfflineKitError::from(std::io::Error::from(std::io::ErrorKind::NotFound)).category(),
            "io"
        );
        assert_eq!(
            OfflineKitError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_storage_context_keeps_source() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = io.storage_context("writing markers").unwrap_err();

        assert_eq!(err.category(), "storage");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Storage error: writing markers");
    }
}
