//! Error types for SMTP sessions.
//!
//! Errors fall into two categories. A [`Status`] is *reportable*: it carries a
//! reply code and text, is written to the client, and the session carries on.
//! Everything else is *fatal*: it is handed to the session handler's error
//! sink and the connection is closed.

use std::io;
use std::time::Duration;

use crate::types::Status;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reportable status, written to the client as a reply.
    #[error("{0}")]
    Status(Status),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// No input arrived within the idle timeout.
    #[error("Read timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol error (input the session cannot recover from).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid server configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure raised by a caller-supplied handler.
    #[error("Handler error: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Creates a reportable error from a reply code and message.
    #[must_use]
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self::Status(Status::new(code, message))
    }

    /// Wraps an arbitrary handler failure as a fatal error.
    #[must_use]
    pub fn handler(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler(err.into())
    }

    /// Returns true if this error is reported to the client and the session
    /// continues.
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        matches!(self, Self::Status(_))
    }

    /// Returns true if this is a permanent (5xx) reportable error.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Status(status) if status.code.is_permanent())
    }

    /// Returns true if this is a transient (4xx) reportable error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Status(status) if status.code.is_transient())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<io::Error> for Error {
    /// Recovers a [`Status`] smuggled through an I/O error, so that data
    /// sinks can reject a message with a proper reply.
    fn from(err: io::Error) -> Self {
        match err.get_ref().and_then(|inner| inner.downcast_ref::<Status>()) {
            Some(status) => Self::Status(status.clone()),
            None => Self::Io(err),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;

    #[test]
    fn status_is_reportable() {
        let err = Error::from(Status::BAD_SEQUENCE);
        assert!(err.is_reportable());
        assert!(err.is_permanent());
        assert!(!err.is_transient());
    }

    #[test]
    fn io_is_fatal() {
        let err = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_reportable());
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn status_recovered_from_io_error() {
        let status = Status::new(552, "Message too large");
        let err = Error::from(io::Error::other(status));
        match err {
            Error::Status(status) => {
                assert_eq!(status.code, ReplyCode::EXCEEDED_STORAGE);
                assert_eq!(status.message, "Message too large");
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn transient_status() {
        assert!(Error::status(451, "Try later").is_transient());
    }

    #[test]
    fn handler_error_display() {
        let err = Error::handler("database unavailable");
        assert_eq!(err.to_string(), "Handler error: database unavailable");
        assert!(!err.is_reportable());
    }

    #[test]
    fn status_display() {
        let err = Error::from(Status::INVALID_SYNTAX);
        assert_eq!(err.to_string(), "501 Invalid syntax");
    }
}
