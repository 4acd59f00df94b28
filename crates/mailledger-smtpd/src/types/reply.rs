//! SMTP reply types.

use std::fmt::Write as _;

use super::Status;

/// SMTP reply sent to the client.
///
/// Every line but the last is written in continuation form (`250-text`),
/// the last in terminating form (`250 text`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Reply message lines.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Creates a single-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self::new(code, vec![text.into()])
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this reply spans more than one line.
    #[must_use]
    pub fn is_multiline(&self) -> bool {
        self.message.len() > 1
    }

    /// Serializes the reply to bytes, CRLF-terminated.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = String::new();
        let last = self.message.len().saturating_sub(1);

        if self.message.is_empty() {
            let _ = write!(buf, "{}\r\n", self.code);
        }
        for (i, line) in self.message.iter().enumerate() {
            let separator = if i == last { ' ' } else { '-' };
            let _ = write!(buf, "{}{separator}{line}\r\n", self.code);
        }

        buf.into_bytes()
    }
}

impl From<Status> for Reply {
    fn from(status: Status) -> Self {
        Self::single(status.code, status.message)
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Reply codes (RFC 5321 section 4.2.3, RFC 4954)
impl ReplyCode {
    /// 200 Nonstandard success response
    pub const SUCCESS: Self = Self(200);
    /// 211 System status
    pub const SYSTEM_STATUS: Self = Self(211);
    /// 214 Help message
    pub const HELP: Self = Self(214);
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTHENTICATED: Self = Self(235);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward
    pub const FORWARD: Self = Self(251);
    /// 252 Cannot verify user, but will accept message
    pub const CANNOT_VERIFY: Self = Self(252);
    /// 334 Provide credentials (AUTH continuation)
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 504 Command parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// 521 Host does not accept mail
    pub const DOES_NOT_ACCEPT_MAIL: Self = Self(521);
    /// 530 Access denied (authentication required)
    pub const ACCESS_DENIED: Self = Self(530);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 551 User not local
    pub const USER_NOT_LOCAL: Self = Self(551);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 553 Mailbox name not allowed
    pub const MAILBOX_NAME_INVALID: Self = Self(553);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
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

    mod reply_code_tests {
        use super::*;

        #[test]
        fn success_codes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::SERVICE_READY.is_success());
            assert!(ReplyCode::CLOSING.is_success());
            assert!(ReplyCode::AUTHENTICATED.is_success());
        }

        #[test]
        fn intermediate_codes() {
            assert!(ReplyCode::AUTH_CONTINUE.is_intermediate());
            assert!(ReplyCode::START_DATA.is_intermediate());
        }

        #[test]
        fn transient_errors() {
            assert!(ReplyCode::MAILBOX_BUSY.is_transient());
            assert!(ReplyCode::SERVICE_UNAVAILABLE.is_transient());
            assert!(ReplyCode::LOCAL_ERROR.is_transient());
            assert!(ReplyCode::INSUFFICIENT_STORAGE.is_transient());
        }

        #[test]
        fn permanent_errors() {
            assert!(ReplyCode::PARAMETER_ERROR.is_permanent());
            assert!(ReplyCode::NOT_IMPLEMENTED.is_permanent());
            assert!(ReplyCode::BAD_SEQUENCE.is_permanent());
            assert!(ReplyCode::ACCESS_DENIED.is_permanent());
            assert!(ReplyCode::TRANSACTION_FAILED.is_permanent());
        }

        #[test]
        fn display() {
            assert_eq!(ReplyCode::OK.to_string(), "250");
            assert_eq!(ReplyCode::new(354).to_string(), "354");
        }
    }

    mod reply_tests {
        use super::*;

        #[test]
        fn serialize_single_line() {
            let reply = Reply::single(ReplyCode::OK, "Go ahead");
            assert_eq!(reply.serialize(), b"250 Go ahead\r\n");
            assert!(!reply.is_multiline());
        }

        #[test]
        fn serialize_multi_line() {
            let reply = Reply::new(
                ReplyCode::OK,
                vec![
                    "mx.example.com Hello client".to_string(),
                    "8BITMIME".to_string(),
                    "PIPELINING".to_string(),
                ],
            );
            assert_eq!(
                reply.serialize(),
                b"250-mx.example.com Hello client\r\n250-8BITMIME\r\n250 PIPELINING\r\n"
            );
            assert!(reply.is_multiline());
        }

        #[test]
        fn serialize_empty_message() {
            let reply = Reply::new(ReplyCode::OK, vec![]);
            assert_eq!(reply.serialize(), b"250\r\n");
        }

        #[test]
        fn from_status() {
            let reply = Reply::from(Status::BAD_SEQUENCE);
            assert_eq!(reply.code, ReplyCode::BAD_SEQUENCE);
            assert_eq!(reply.message, vec!["Invalid command sequence"]);
            assert!(!reply.is_success());
        }
    }
}
