//! Error types for the `sse` crate.
//!
//! Follows the same layered pattern used across the workspace: a root `Error`
//! struct holding an `ErrorKind` tree plus the optional underlying source.
//! Only configuration errors, registration failures against the distributed
//! store and cancellation are expected to reach a caller; everything else is
//! logged and degraded at the point where it happens.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the `sse` crate.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the `sse` crate.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Config(ConfigErrorKind),
    Store(StoreErrorKind),
    Write(WriteErrorKind),
    Relay(RelayErrorKind),
    /// The caller's cancellation token fired. Not a failure.
    Cancelled,
}

/// Invalid option values, detected at startup.
#[derive(Debug, PartialEq)]
pub enum ConfigErrorKind {
    /// `refresh_interval` is not strictly shorter than `connection_ttl`.
    TtlRefreshInterval,
    MissingConnectionString,
    InvalidInterval,
}

/// Failures talking to the distributed connection store.
#[derive(Debug, PartialEq)]
pub enum StoreErrorKind {
    Unavailable,
    Transaction,
}

/// Failures writing a frame to a single connection.
#[derive(Debug, PartialEq)]
pub enum WriteErrorKind {
    /// The writer was disposed; no further writes will ever succeed.
    Disposed,
    /// The transport side went away (client disconnected).
    Closed,
    Timeout,
}

/// Failures on the cross-server backplane.
#[derive(Debug, PartialEq)]
pub enum RelayErrorKind {
    Publish,
    Subscribe,
    Malformed,
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Error {
            source: None,
            error_kind,
        }
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Config(kind) => write!(f, "Configuration error: {:?}", kind)?,
            ErrorKind::Store(kind) => write!(f, "Connection store error: {:?}", kind)?,
            ErrorKind::Write(kind) => write!(f, "Connection write error: {:?}", kind)?,
            ErrorKind::Relay(kind) => write!(f, "Backplane error: {:?}", kind)?,
            ErrorKind::Cancelled => write!(f, "Operation cancelled")?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.kind() == redis::ErrorKind::ExecAbortError {
            StoreErrorKind::Transaction
        } else {
            StoreErrorKind::Unavailable
        };
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Store(kind),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Relay(RelayErrorKind::Malformed),
        }
    }
}

/// Helper function to create configuration errors.
pub fn config_error(kind: ConfigErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Config(kind),
    }
}

/// Helper function to create write errors.
pub fn write_error(kind: WriteErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Write(kind),
    }
}

/// Helper function to create backplane errors.
pub fn relay_error(kind: RelayErrorKind, source: Box<dyn StdError + Send + Sync>) -> Error {
    Error {
        source: Some(source),
        error_kind: ErrorKind::Relay(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_distinguished_from_failures() {
        assert!(Error::cancelled().is_cancelled());
        assert!(!write_error(WriteErrorKind::Closed, "gone").is_cancelled());
    }

    #[test]
    fn test_display_includes_source_message() {
        let err = config_error(ConfigErrorKind::MissingConnectionString, "redis url");
        assert_eq!(
            err.to_string(),
            "Configuration error: MissingConnectionString (redis url)"
        );
    }

    #[test]
    fn test_serde_json_errors_map_to_malformed_relay_messages() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert_eq!(err.error_kind, ErrorKind::Relay(RelayErrorKind::Malformed));
        assert!(err.source.is_some());
    }
}
