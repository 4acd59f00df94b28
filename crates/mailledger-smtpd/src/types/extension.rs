//! SMTP service extensions advertised in the EHLO reply.

use std::fmt;

/// An extension keyword line of the EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// SIZE - Maximum message size
    Size(u64),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication
    Auth(Vec<AuthMechanism>),
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size(size) => write!(f, "SIZE {size}"),
            Self::EightBitMime => f.write_str("8BITMIME"),
            Self::Pipelining => f.write_str("PIPELINING"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth(mechanisms) => {
                f.write_str("AUTH")?;
                for mechanism in mechanisms {
                    write!(f, " {}", mechanism.as_str())?;
                }
                Ok(())
            }
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication (RFC 4616)
    Plain,
    /// LOGIN - legacy plaintext
    Login,
}

impl AuthMechanism {
    /// Mechanisms this server implements, in advertisement order.
    pub const SUPPORTED: [Self; 2] = [Self::Plain, Self::Login];

    /// Looks up a mechanism name, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|mechanism| mechanism.as_str().eq_ignore_ascii_case(s))
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
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

    mod extension_display_tests {
        use super::*;

        #[test]
        fn size() {
            assert_eq!(Extension::Size(52_428_800).to_string(), "SIZE 52428800");
        }

        #[test]
        fn keywords() {
            assert_eq!(Extension::EightBitMime.to_string(), "8BITMIME");
            assert_eq!(Extension::Pipelining.to_string(), "PIPELINING");
            assert_eq!(Extension::StartTls.to_string(), "STARTTLS");
        }

        #[test]
        fn auth() {
            let ext = Extension::Auth(AuthMechanism::SUPPORTED.to_vec());
            assert_eq!(ext.to_string(), "AUTH PLAIN LOGIN");
        }
    }

    mod auth_mechanism_tests {
        use super::*;

        #[test]
        fn parse_plain() {
            assert_eq!(AuthMechanism::parse("PLAIN"), Some(AuthMechanism::Plain));
            assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
        }

        #[test]
        fn parse_login() {
            assert_eq!(AuthMechanism::parse("Login"), Some(AuthMechanism::Login));
        }

        #[test]
        fn parse_unknown() {
            assert_eq!(AuthMechanism::parse("CRAM-MD5"), None);
            assert_eq!(AuthMechanism::parse(""), None);
        }
    }
}
