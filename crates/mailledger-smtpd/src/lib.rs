//! # mailledger-smtpd
//!
//! An embeddable SMTP server protocol engine (RFC 5321) for tokio.
//!
//! The crate speaks the protocol and nothing else. Authentication, sender and
//! recipient policy, and message storage are delegated to caller-supplied
//! handlers; see [`handler`].
//!
//! ## Features
//!
//! - **Session state machine**: greeting, mail transaction and TLS state
//!   tracked per connection, with command ordering enforced
//! - **Verbs**: EHLO, HELO, MAIL, RCPT, DATA, RSET, NOOP, QUIT, AUTH, STARTTLS
//! - **STARTTLS**: rustls-based upgrade with a fresh session after the handshake
//! - **Authentication**: PLAIN (inline or interactive) and LOGIN
//! - **Extensions advertised**: SIZE, 8BITMIME, PIPELINING, STARTTLS, AUTH
//!
//! ## Quick Start
//!
//! ```ignore
//! use async_trait::async_trait;
//! use mailledger_smtpd::{
//!     Address, DataSink, MessageHandler, Result, Server, SessionHandler,
//! };
//! use tokio::net::TcpListener;
//!
//! struct Policy;
//!
//! #[async_trait]
//! impl SessionHandler for Policy {
//!     async fn authenticate(&mut self, user: &str, pass: &str) -> Result<()> {
//!         // check credentials
//!         Ok(())
//!     }
//!
//!     async fn message_handler(&mut self, from: &Address) -> Result<Box<dyn MessageHandler>> {
//!         Ok(Box::new(Spool::new(from)))
//!     }
//!
//!     fn max_message_size(&self) -> u64 {
//!         25 * 1024 * 1024
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> mailledger_smtpd::Result<()> {
//!     let server = Server::builder("mx.example.com")
//!         .on_connection(|_peer, _encrypted| Some(Box::new(Policy) as Box<dyn SessionHandler>))
//!         .build()?;
//!
//!     server.serve(TcpListener::bind("0.0.0.0:2525").await?).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: Command line parser and verb table
//! - [`connection`]: Line/DATA framing, plaintext and TLS transport
//! - [`handler`]: Policy and message handler traits
//! - [`server`]: Configuration, builder and accept loop
//! - [`session`]: Per-connection state machine
//! - [`types`]: Replies, status codes, addresses, extensions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod handler;
pub mod server;
pub mod session;
pub mod types;

pub use connection::load_server_config;
pub use error::{Error, Result};
pub use handler::{ConnectionFactory, DataSink, MessageHandler, SessionHandler};
pub use server::{Config, Server, ServerBuilder};
pub use session::Session;
pub use types::{Address, AuthMechanism, Extension, Reply, ReplyCode, Status};
