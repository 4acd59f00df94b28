//! Accept loop and server construction.
//!
//! ```ignore
//! use mailledger_smtpd::{Server, SessionHandler};
//! use tokio::net::TcpListener;
//!
//! let server = Server::builder("mx.example.com")
//!     .require_tls(true)
//!     .tls(mailledger_smtpd::load_server_config("cert.pem", "key.pem")?)
//!     .on_connection(|_peer, _encrypted| Some(Box::new(MyPolicy) as Box<dyn SessionHandler>))
//!     .build()?;
//!
//! server.serve(TcpListener::bind("0.0.0.0:25").await?).await?;
//! ```

mod config;

pub use config::{Config, DEFAULT_TIMEOUT};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::handler::{ConnectionFactory, SessionHandler};
use crate::session::Session;
use crate::{Error, Result};

/// Pause after a transient accept failure.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// An SMTP server: configuration plus the connection factory.
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    factory: Arc<dyn ConnectionFactory>,
}

impl Server {
    /// Creates a server builder.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(hostname)
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accepts connections until the listener fails permanently.
    ///
    /// Transient accept failures are logged and retried after a short pause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] with the first permanent accept failure.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, hostname = %self.config.hostname, "SMTP server listening");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %err, "failed to set TCP_NODELAY");
                    }
                    self.spawn(stream, peer);
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(error = %err, "transient accept error, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    /// Starts a session on an accepted connection.
    ///
    /// Returns `None` if the connection factory declined the connection, in
    /// which case `stream` is dropped without a reply.
    pub fn spawn<S>(&self, stream: S, peer: SocketAddr) -> Option<JoinHandle<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(handler) = self.factory.on_connection(peer, false) else {
            tracing::debug!(%peer, "connection declined");
            return None;
        };

        tracing::info!(%peer, "connection accepted");
        let session = Session::new(
            stream,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
            handler,
        );
        Some(tokio::spawn(session.run()))
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: Config,
    factory: Option<Arc<dyn ConnectionFactory>>,
}

impl ServerBuilder {
    /// Creates a builder with the default configuration for `hostname`.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            config: Config::new(hostname),
            factory: None,
        }
    }

    /// Sets the per-read idle timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Enables STARTTLS with the given TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Rejects MAIL until the client has started TLS.
    #[must_use]
    pub const fn require_tls(mut self, require: bool) -> Self {
        self.config.require_tls = require;
        self
    }

    /// Advertises AUTH in the EHLO reply.
    #[must_use]
    pub const fn require_auth(mut self, require: bool) -> Self {
        self.config.require_auth = require;
        self
    }

    /// Sets the connection factory from a closure.
    #[must_use]
    pub fn on_connection<F>(self, factory: F) -> Self
    where
        F: Fn(SocketAddr, bool) -> Option<Box<dyn SessionHandler>> + Send + Sync + 'static,
    {
        self.factory(Arc::new(factory))
    }

    /// Sets the connection factory.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Builds the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no connection factory was set.
    pub fn build(self) -> Result<Server> {
        let factory = self
            .factory
            .ok_or_else(|| Error::Config("a connection factory is required".to_string()))?;
        Ok(Server {
            config: Arc::new(self.config),
            factory,
        })
    }
}

/// Accept failures worth retrying: the connection died before we got to it,
/// or the process is out of file descriptors for the moment.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        // ENFILE, EMFILE
        if matches!(err.raw_os_error(), Some(23 | 24)) {
            return true;
        }
    }

    false
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
    use crate::handler::MessageHandler;
    use crate::types::{Address, Status};
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Accepting;

    #[async_trait]
    impl SessionHandler for Accepting {
        async fn authenticate(&mut self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }

        async fn message_handler(&mut self, _from: &Address) -> Result<Box<dyn MessageHandler>> {
            Err(Status::new(451, "not today").into())
        }

        fn max_message_size(&self) -> u64 {
            1024
        }
    }

    fn peer() -> SocketAddr {
        "192.0.2.1:4321".parse().unwrap()
    }

    mod builder {
        use super::*;

        #[test]
        fn test_requires_factory() {
            let err = Server::builder("mx.example.com").build().err().unwrap();
            assert!(matches!(err, Error::Config(_)));
        }

        #[test]
        fn test_options() {
            let server = Server::builder("mx.example.com")
                .timeout(Duration::from_secs(10))
                .require_tls(true)
                .require_auth(true)
                .on_connection(|_, _| None)
                .build()
                .unwrap();

            let config = server.config();
            assert_eq!(config.hostname, "mx.example.com");
            assert_eq!(config.timeout, Duration::from_secs(10));
            assert!(config.require_tls);
            assert!(config.require_auth);
            assert!(config.tls.is_none());
        }
    }

    mod accept {
        use super::*;

        #[test]
        fn test_transient_errors() {
            assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
            assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
            assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
            assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        }

        #[cfg(unix)]
        #[test]
        fn test_descriptor_exhaustion_is_transient() {
            assert!(is_transient(&io::Error::from_raw_os_error(24)));
            assert!(is_transient(&io::Error::from_raw_os_error(23)));
        }

        #[tokio::test]
        async fn test_declined_connection_is_dropped() {
            let server = Server::builder("mx.example.com")
                .on_connection(|_, _| None)
                .build()
                .unwrap();

            let (mut client, server_side) = tokio::io::duplex(1024);
            assert!(server.spawn(server_side, peer()).is_none());

            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf)
                .await
                .unwrap();
            assert!(buf.is_empty());
        }

        #[tokio::test]
        async fn test_accepted_connection_is_greeted() {
            let server = Server::builder("mx.example.com")
                .on_connection(|_, encrypted| {
                    assert!(!encrypted);
                    Some(Box::new(Accepting) as Box<dyn SessionHandler>)
                })
                .build()
                .unwrap();

            let (client, server_side) = tokio::io::duplex(1024);
            let handle = server.spawn(server_side, peer()).unwrap();

            let mut client = BufReader::new(client);
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            assert_eq!(line, "220 mx.example.com ESMTP ready\r\n");

            client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
            line.clear();
            client.read_line(&mut line).await.unwrap();
            assert_eq!(line, "221 OK, bye\r\n");

            handle.await.unwrap();
        }

        #[tokio::test]
        async fn test_serve_over_tcp() {
            let server = Server::builder("mx.example.com")
                .on_connection(|_, _| Some(Box::new(Accepting) as Box<dyn SessionHandler>))
                .build()
                .unwrap();

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let task = tokio::spawn(async move { server.serve(listener).await });

            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut client = BufReader::new(stream);
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("220 mx.example.com"));

            client
                .get_mut()
                .write_all(b"EHLO client\r\nMAIL FROM:<a@example.com>\r\n")
                .await
                .unwrap();
            let mut replies = Vec::new();
            loop {
                line.clear();
                client.read_line(&mut line).await.unwrap();
                replies.push(line.clone());
                if line.starts_with("451") {
                    break;
                }
            }
            assert!(replies[0].starts_with("250-mx.example.com Hello client"));
            assert_eq!(replies.last().unwrap(), "451 not today\r\n");

            task.abort();
        }
    }
}
