//! Reportable statuses.

use std::borrow::Cow;

use super::ReplyCode;

/// A reply code and message that is reported to the client.
///
/// A status is returned both for successful outcomes (the reply to send) and
/// for recoverable failures (the rejection to send). Either way the session
/// keeps running after it has been written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct Status {
    /// Reply code.
    pub code: ReplyCode,
    /// Human-readable reply text.
    pub message: Cow<'static, str>,
}

impl Status {
    /// Creates a status from a numeric code and a message.
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: ReplyCode::new(code),
            message: Cow::Owned(message.into()),
        }
    }

    const fn fixed(code: ReplyCode, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
        }
    }

    /// `235 OK, you are now authenticated`
    pub const AUTH_SUCCESS: Self = Self::fixed(ReplyCode::AUTHENTICATED, "OK, you are now authenticated");
    /// `250 Go ahead`
    pub const GO_AHEAD: Self = Self::fixed(ReplyCode::OK, "Go ahead");
    /// `250 Thank you`
    pub const THANK_YOU: Self = Self::fixed(ReplyCode::OK, "Thank you");
    /// `221 OK, bye`
    pub const GOODBYE: Self = Self::fixed(ReplyCode::CLOSING, "OK, bye");
    /// `354 Go ahead. End your data with <CR><LF>.<CR><LF>`
    pub const START_INPUT: Self = Self::fixed(
        ReplyCode::START_DATA,
        "Go ahead. End your data with <CR><LF>.<CR><LF>",
    );

    /// `503 Invalid command sequence`
    pub const BAD_SEQUENCE: Self = Self::fixed(ReplyCode::BAD_SEQUENCE, "Invalid command sequence");
    /// `501 Couldn't decode your credentials`
    pub const DECODING_CREDENTIALS: Self = Self::fixed(
        ReplyCode::PARAMETER_ERROR,
        "Couldn't decode your credentials",
    );
    /// `501 Invalid syntax`
    pub const INVALID_SYNTAX: Self = Self::fixed(ReplyCode::PARAMETER_ERROR, "Invalid syntax");
    /// `501 Malformed email address`
    pub const MALFORMED_ADDRESS: Self = Self::fixed(ReplyCode::PARAMETER_ERROR, "Malformed email address");
    /// `503 Please introduce yourself first`
    pub const NO_HELO: Self = Self::fixed(ReplyCode::BAD_SEQUENCE, "Please introduce yourself first");
    /// `502 Unsupported command`
    pub const UNSUPPORTED_COMMAND: Self = Self::fixed(ReplyCode::NOT_IMPLEMENTED, "Unsupported command");
    /// `502 Unknown authentication mechanism`
    pub const UNKNOWN_MECHANISM: Self = Self::fixed(
        ReplyCode::NOT_IMPLEMENTED,
        "Unknown authentication mechanism",
    );
    /// `501 Authentication cancelled`
    pub const AUTH_CANCELLED: Self = Self::fixed(ReplyCode::PARAMETER_ERROR, "Authentication cancelled");
    /// `503 please start TLS 1st`
    pub const TLS_REQUIRED: Self = Self::fixed(ReplyCode::BAD_SEQUENCE, "please start TLS 1st");
    /// `501 already running TLS`
    pub const ALREADY_TLS: Self = Self::fixed(ReplyCode::PARAMETER_ERROR, "already running TLS");
    /// `502 TLS not supported`
    pub const TLS_UNSUPPORTED: Self = Self::fixed(ReplyCode::NOT_IMPLEMENTED, "TLS not supported");
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

    #[test]
    fn display() {
        assert_eq!(Status::GO_AHEAD.to_string(), "250 Go ahead");
        assert_eq!(Status::NO_HELO.to_string(), "503 Please introduce yourself first");
    }

    #[test]
    fn new_owns_message() {
        let status = Status::new(550, format!("No such user {}", "bob"));
        assert_eq!(status.code, ReplyCode::MAILBOX_UNAVAILABLE);
        assert_eq!(status.message, "No such user bob");
    }

    #[test]
    fn named_codes() {
        assert_eq!(Status::AUTH_SUCCESS.code.as_u16(), 235);
        assert_eq!(Status::START_INPUT.code.as_u16(), 354);
        assert_eq!(Status::MALFORMED_ADDRESS.code.as_u16(), 501);
        assert_eq!(Status::TLS_UNSUPPORTED.code.as_u16(), 502);
        assert_eq!(Status::TLS_REQUIRED.code.as_u16(), 503);
    }
}
