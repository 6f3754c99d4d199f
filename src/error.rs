//! Unified error handling for the stickypool crate
//!
//! Module-level errors (`IpcError`, `TransferError`) stay close to the code that
//! produces them and convert into the crate-wide [`Error`] when they cross a
//! module boundary.
//!
//! # Usage
//!
//! The pool uses [`Error::is_recoverable`] to decide whether a failed respawn
//! is retried, and every error log carries [`ErrorCategory::label`]:
//!
//! ```rust,ignore
//! use stickypool::error::Error;
//!
//! fn report(err: &Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(category = err.category().label(), "recoverable: {err}");
//!     } else {
//!         tracing::error!(category = err.category().label(), "fatal: {err}");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::cluster::channel::{IpcError, TransferError};

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Socket and listener errors
    Network,
    /// Worker process creation and supervision
    Process,
    /// Master/worker channel errors, including connection transfer
    Ipc,
    /// Configuration and validation errors
    Config,
}

impl ErrorCategory {
    /// Short lowercase label, used as a metrics/log field value
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Process => "process",
            Self::Ipc => "ipc",
            Self::Config => "config",
        }
    }
}

/// Unified error type for the stickypool crate
#[derive(Error, Debug)]
pub enum Error {
    /// A worker process could not be created
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Master/worker channel errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Connection handoff errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this error is recoverable without restarting the process
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Spawn(_) => true, // the pool retries after a backoff
            Self::Ipc(e) => e.is_recoverable(),
            Self::Transfer(_) => true, // only the affected connection is lost
            Self::Io(_) => true,
            Self::Config(_) => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Spawn(_) => ErrorCategory::Process,
            Self::Ipc(_) | Self::Transfer(_) => ErrorCategory::Ipc,
            Self::Io(_) => ErrorCategory::Network,
            Self::Config(_) => ErrorCategory::Config,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(Error::spawn("no such file").category(), ErrorCategory::Process);
        assert_eq!(
            Error::Transfer(TransferError::ChannelClosed).category(),
            ErrorCategory::Ipc
        );
        assert_eq!(
            Error::Io(io::Error::new(io::ErrorKind::AddrInUse, "busy")).category(),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::spawn("fork failed").is_recoverable());
        assert!(Error::Transfer(TransferError::ChannelClosed).is_recoverable());
        assert!(!Error::config("bad port").is_recoverable());
        assert!(!Error::Ipc(IpcError::UnexpectedFrame { len: 3 }).is_recoverable());
    }

    #[test]
    fn test_error_conversion() {
        let unified: Error = TransferError::ChannelClosed.into();
        assert!(matches!(unified, Error::Transfer(_)));

        let unified: Error = crate::config::ConfigError::InvalidValue {
            field: "workers".to_string(),
            reason: "Must run at least 1 worker".to_string(),
        }
        .into();
        assert_eq!(unified.category(), ErrorCategory::Config);
        assert!(unified.to_string().contains("workers"));
    }

    #[test]
    fn test_category_label() {
        assert_eq!(ErrorCategory::Ipc.label(), "ipc");
        assert_eq!(ErrorCategory::Config.label(), "config");
    }
}
