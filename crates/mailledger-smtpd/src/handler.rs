//! Caller-supplied handlers.
//!
//! The session engine only speaks the protocol. Every decision about who may
//! authenticate, which senders and recipients are accepted, and where message
//! content goes is delegated to two handler objects:
//!
//! - a [`SessionHandler`], one per connection (and a fresh one after
//!   STARTTLS), obtained from the server's [`ConnectionFactory`];
//! - a [`MessageHandler`], one per mail transaction, obtained from the
//!   session handler when MAIL is accepted.
//!
//! Handlers reject with `Err(Error::Status(..))`; the status is written to
//! the client verbatim and the session continues. Any other error is fatal.
//!
//! # Example
//!
//! ```ignore
//! use async_trait::async_trait;
//! use mailledger_smtpd::{Address, DataSink, MessageHandler, Result, SessionHandler, Status};
//!
//! struct Policy;
//!
//! #[async_trait]
//! impl SessionHandler for Policy {
//!     async fn authenticate(&mut self, _user: &str, _pass: &str) -> Result<()> {
//!         Err(Status::new(535, "Authentication credentials invalid").into())
//!     }
//!
//!     async fn message_handler(&mut self, from: &Address) -> Result<Box<dyn MessageHandler>> {
//!         // ...
//!     }
//!
//!     fn max_message_size(&self) -> u64 {
//!         10 * 1024 * 1024
//!     }
//! }
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::types::Address;
use crate::{Error, Result};

/// Sink receiving the message content of one DATA phase.
///
/// The message counts as received only if every write and the final
/// `shutdown` succeed. To reject with a specific reply (for example a size
/// limit), fail with `io::Error::other(status)`.
pub type DataSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Policy for a single SMTP session.
///
/// A session calls its handler sequentially; there is never more than one
/// call in flight.
#[async_trait]
pub trait SessionHandler: Send {
    /// Checks a username and password from AUTH PLAIN or AUTH LOGIN.
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()>;

    /// Opens a message handler for a new transaction from `from`.
    async fn message_handler(&mut self, from: &Address) -> Result<Box<dyn MessageHandler>>;

    /// Accepts or rejects the HELO/EHLO name. `extended` is true for EHLO.
    async fn helo(&mut self, name: &str, extended: bool) -> Result<()> {
        let _ = (name, extended);
        Ok(())
    }

    /// Receives the fatal error that ends the session.
    fn session_error(&mut self, error: &Error) {
        tracing::warn!(%error, "SMTP session error");
    }

    /// Maximum message size, advertised in the EHLO reply.
    fn max_message_size(&self) -> u64;
}

/// Handler for one mail transaction.
#[async_trait]
pub trait MessageHandler: Send {
    /// Adds a recipient to the envelope.
    async fn add_recipient(&mut self, recipient: &Address) -> Result<()>;

    /// Returns the sink for the message content.
    async fn data_writer(&mut self) -> Result<DataSink>;
}

/// Produces a [`SessionHandler`] for each connection.
///
/// Called once when a connection is accepted (`encrypted == false`) and
/// again after a successful STARTTLS (`encrypted == true`). Returning `None`
/// drops the connection without a reply.
pub trait ConnectionFactory: Send + Sync {
    /// Creates the handler for a connection from `peer`.
    fn on_connection(&self, peer: SocketAddr, encrypted: bool) -> Option<Box<dyn SessionHandler>>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(SocketAddr, bool) -> Option<Box<dyn SessionHandler>> + Send + Sync,
{
    fn on_connection(&self, peer: SocketAddr, encrypted: bool) -> Option<Box<dyn SessionHandler>> {
        self(peer, encrypted)
    }
}
