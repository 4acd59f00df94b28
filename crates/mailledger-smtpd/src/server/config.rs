//! Server configuration.

use std::sync::Arc;
use std::time::Duration;

/// Default per-read idle timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// SMTP server configuration, shared read-only by every session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name announced in the greeting and the EHLO reply.
    pub hostname: String,
    /// Idle timeout applied to every read.
    pub timeout: Duration,
    /// TLS material. STARTTLS is offered only when set.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Reject MAIL until the connection is encrypted.
    pub require_tls: bool,
    /// Advertise AUTH in the EHLO reply.
    pub require_auth: bool,
}

impl Config {
    /// Creates a plaintext configuration with the default timeout.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            timeout: DEFAULT_TIMEOUT,
            tls: None,
            require_tls: false,
            require_auth: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("mx.example.com");
        assert_eq!(config.hostname, "mx.example.com");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(config.tls.is_none());
        assert!(!config.require_tls);
        assert!(!config.require_auth);
    }
}
