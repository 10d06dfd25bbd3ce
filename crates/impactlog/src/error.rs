//! Error types for impactlog.
//!
//! This module defines the crate-wide error type. The producer-facing storage
//! contract has its own [`StorageError`](crate::event_log::StorageError) and the
//! sensor collaborator has [`SensorError`](crate::monitor::SensorError); both
//! convert into [`Error`] where they cross into the rest of the crate.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::event_log::StorageError;

/// The main error type for impactlog operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// The event log rejected an operation.
    #[error(transparent)]
    Storage(#[from] StorageError),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Server Errors ===
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the server tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configured bind address could not be parsed.
    #[error("invalid bind address '{address}'")]
    InvalidBindAddress {
        /// The rejected address string.
        address: String,
    },

    /// A page asset (template or stylesheet) could not be opened.
    #[error("failed to open page asset {path}: {source}")]
    Asset {
        /// Path of the asset.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The monitor thread could not be started.
    #[error("failed to start monitor: {0}")]
    MonitorStart(String),

    // === I/O Errors ===
    /// Socket or file system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for impactlog operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Check if this error came from the event log.
    #[must_use]
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Check if this error is the peer going away mid-response.
    ///
    /// These are routine on a page that polls and are logged at a lower level.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::config("port must be set");
        assert_eq!(
            err.to_string(),
            "invalid configuration: port must be set"
        );
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: Error = StorageError::MalformedRecord {
            field: "a,b".to_string(),
        }
        .into();
        assert!(err.is_storage_error());
        assert!(err.to_string().contains("a,b"));
    }

    #[test]
    fn test_bind_error_display() {
        let err = Error::Bind {
            addr: "0.0.0.0:80".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:80"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_invalid_bind_address_display() {
        let err = Error::InvalidBindAddress {
            address: "not-an-ip".to_string(),
        };
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn test_is_disconnect() {
        let reset: Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(reset.is_disconnect());

        let other: Error = std::io::Error::other("boom").into();
        assert!(!other.is_disconnect());
        assert!(!Error::config("x").is_disconnect());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_asset_error_display() {
        let err = Error::Asset {
            path: PathBuf::from("/srv/index.html"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/srv/index.html"));
    }
}
