//! Per-connection SMTP state machine.
//!
//! A [`Session`] owns the connection and everything known about it: the
//! session handler, the open mail transaction (if any) and whether the
//! client has greeted us or upgraded to TLS. Each command is parsed, looked
//! up in the verb table and run against that state; the verb's outcome
//! decides the reply and whether the loop goes on.
//!
//! ```text
//!            HELO/EHLO            MAIL              RCPT*        DATA
//! connected ───────────→ greeted ──────→ in transaction ────→ ─────→ greeted
//!                           ↑                  │
//!                           └─── RSET/HELO ────┘
//! ```
//!
//! STARTTLS does not mutate the session. It hands a fresh session handler
//! back to the loop, which performs the handshake and rebuilds the session
//! around the encrypted stream with a clean state.

mod auth;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::command::{Command, Verb};
use crate::connection::{FramedStream, SmtpStream};
use crate::handler::{ConnectionFactory, MessageHandler, SessionHandler};
use crate::server::Config;
use crate::types::{Address, AuthMechanism, Extension, Reply, ReplyCode, Status};
use crate::{Error, Result};

/// What a verb asks the loop to do next.
enum Outcome {
    /// Write the reply and read the next command.
    Reply(Reply),
    /// Write the reply and end the session.
    Close(Reply),
    /// STARTTLS accepted and acknowledged: handshake, then start over.
    Upgrade {
        tls: Arc<rustls::ServerConfig>,
        handler: Box<dyn SessionHandler>,
    },
    /// End the session without a reply.
    Hangup,
}

impl Outcome {
    fn reply(status: Status) -> Self {
        Self::Reply(status.into())
    }
}

enum Flow {
    Continue,
    Stop,
    Upgrade {
        tls: Arc<rustls::ServerConfig>,
        handler: Box<dyn SessionHandler>,
    },
}

/// An SMTP session bound to one client connection.
pub struct Session<S> {
    stream: FramedStream<SmtpStream<S>>,
    config: Arc<Config>,
    factory: Arc<dyn ConnectionFactory>,
    peer: SocketAddr,
    handler: Box<dyn SessionHandler>,
    message: Option<Box<dyn MessageHandler>>,
    greeted: bool,
    encrypted: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a session for a freshly accepted plaintext connection.
    pub fn new(
        stream: S,
        peer: SocketAddr,
        config: Arc<Config>,
        factory: Arc<dyn ConnectionFactory>,
        handler: Box<dyn SessionHandler>,
    ) -> Self {
        Self::with_stream(SmtpStream::plain(stream), peer, config, factory, handler)
    }

    fn with_stream(
        stream: SmtpStream<S>,
        peer: SocketAddr,
        config: Arc<Config>,
        factory: Arc<dyn ConnectionFactory>,
        handler: Box<dyn SessionHandler>,
    ) -> Self {
        let encrypted = stream.is_tls();
        Self {
            stream: FramedStream::new(stream, config.timeout),
            config,
            factory,
            peer,
            handler,
            message: None,
            greeted: false,
            encrypted,
        }
    }

    /// Returns the client's address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true once HELO or EHLO has been accepted.
    #[must_use]
    pub const fn is_greeted(&self) -> bool {
        self.greeted
    }

    /// Returns true if the connection has been upgraded to TLS.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Returns true while a mail transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.message.is_some()
    }

    /// Sends the greeting and serves commands until the client quits or the
    /// connection fails. The connection is closed on return.
    pub async fn run(mut self) {
        let greeting = Reply::single(
            ReplyCode::SERVICE_READY,
            format!("{} ESMTP ready", self.config.hostname),
        );
        if let Err(err) = self.stream.write_reply(&greeting).await {
            self.fail(&err);
            self.close().await;
            return;
        }

        loop {
            match self.serve_one().await {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Upgrade { tls, handler } => match self.upgrade(tls, handler).await {
                    Some(session) => self = session,
                    None => return,
                },
            }
        }

        self.close().await;
    }

    async fn serve_one(&mut self) -> Flow {
        let line = match self.stream.read_line().await {
            Ok(line) => line,
            Err(err) => {
                self.fail(&err);
                return Flow::Stop;
            }
        };

        let command = Command::parse(&line);
        tracing::debug!(peer = %self.peer, verb = %command.verb, "SMTP command");

        let outcome = self.dispatch(&command).await;
        self.respond(outcome).await
    }

    async fn respond(&mut self, outcome: Result<Outcome>) -> Flow {
        let (reply, flow) = match outcome {
            Ok(Outcome::Reply(reply)) => (reply, Flow::Continue),
            Ok(Outcome::Close(reply)) => (reply, Flow::Stop),
            Ok(Outcome::Upgrade { tls, handler }) => return Flow::Upgrade { tls, handler },
            Ok(Outcome::Hangup) => return Flow::Stop,
            Err(Error::Status(status)) => {
                tracing::debug!(peer = %self.peer, %status, "SMTP command rejected");
                (status.into(), Flow::Continue)
            }
            Err(err) => {
                self.fail(&err);
                return Flow::Stop;
            }
        };

        match self.stream.write_reply(&reply).await {
            Ok(()) => flow,
            Err(err) => {
                self.fail(&err);
                Flow::Stop
            }
        }
    }

    async fn dispatch(&mut self, command: &Command) -> Result<Outcome> {
        let Some(verb) = Verb::lookup(&command.verb) else {
            return Err(Status::UNSUPPORTED_COMMAND.into());
        };
        if !self.greeted && !verb.allowed_before_greeting() {
            return Err(Status::NO_HELO.into());
        }

        match verb {
            Verb::Auth => self.auth(command).await,
            Verb::Data => self.data().await,
            Verb::Ehlo => self.ehlo(command).await,
            Verb::Helo => self.helo(command).await,
            Verb::Mail => self.mail(command).await,
            Verb::Noop => Ok(Outcome::reply(Status::GO_AHEAD)),
            Verb::Quit => Ok(Outcome::Close(Status::GOODBYE.into())),
            Verb::Rcpt => self.rcpt(command).await,
            Verb::Rset => Ok(self.rset()),
            Verb::StartTls => self.starttls().await,
        }
    }

    async fn ehlo(&mut self, command: &Command) -> Result<Outcome> {
        let name = greeting_name(command)?;
        self.message = None;
        self.handler.helo(name, true).await?;
        self.greeted = true;

        let mut lines = vec![format!("{} Hello {name}", self.config.hostname)];
        lines.extend(self.extensions().iter().map(ToString::to_string));
        Ok(Outcome::Reply(Reply::new(ReplyCode::OK, lines)))
    }

    async fn helo(&mut self, command: &Command) -> Result<Outcome> {
        let name = greeting_name(command)?;
        self.message = None;
        self.handler.helo(name, false).await?;
        self.greeted = true;
        Ok(Outcome::reply(Status::GO_AHEAD))
    }

    async fn mail(&mut self, command: &Command) -> Result<Outcome> {
        if self.config.require_tls && !self.encrypted {
            return Err(Status::TLS_REQUIRED.into());
        }
        self.message = None;

        let from = Address::parse_path(command.param("FROM").ok_or(Status::INVALID_SYNTAX)?)?;
        let message = self.handler.message_handler(&from).await?;
        tracing::debug!(peer = %self.peer, %from, "mail transaction opened");

        self.message = Some(message);
        Ok(Outcome::reply(Status::GO_AHEAD))
    }

    async fn rcpt(&mut self, command: &Command) -> Result<Outcome> {
        let Some(message) = self.message.as_mut() else {
            return Err(Status::BAD_SEQUENCE.into());
        };

        let to = Address::parse_path(command.param("TO").ok_or(Status::INVALID_SYNTAX)?)?;
        message.add_recipient(&to).await?;
        Ok(Outcome::reply(Status::GO_AHEAD))
    }

    /// Only one DATA phase is allowed per MAIL: the transaction is taken out
    /// up front so that it is gone whichever way this returns.
    async fn data(&mut self) -> Result<Outcome> {
        let mut message = self.message.take().ok_or(Status::BAD_SEQUENCE)?;
        let mut sink = message.data_writer().await?;

        self.stream.write_reply(&Status::START_INPUT.into()).await?;
        let size = self.stream.read_data(&mut sink).await?;
        sink.shutdown().await?;

        tracing::debug!(peer = %self.peer, size, "message received");
        Ok(Outcome::reply(Status::THANK_YOU))
    }

    fn rset(&mut self) -> Outcome {
        self.message = None;
        Outcome::reply(Status::GO_AHEAD)
    }

    async fn starttls(&mut self) -> Result<Outcome> {
        if self.encrypted {
            return Err(Status::ALREADY_TLS.into());
        }
        let Some(tls) = self.config.tls.clone() else {
            return Err(Status::TLS_UNSUPPORTED.into());
        };

        self.stream
            .write_reply(&Reply::single(ReplyCode::SERVICE_READY, "Go ahead"))
            .await?;

        match self.factory.on_connection(self.peer, true) {
            Some(handler) => Ok(Outcome::Upgrade { tls, handler }),
            None => {
                tracing::debug!(peer = %self.peer, "connection declined after STARTTLS");
                Ok(Outcome::Hangup)
            }
        }
    }

    /// Performs the TLS handshake and rebuilds the session around the
    /// encrypted stream. Nothing from the plaintext phase survives. A failed
    /// handshake closes the transport and ends the session.
    async fn upgrade(
        self,
        tls: Arc<rustls::ServerConfig>,
        mut handler: Box<dyn SessionHandler>,
    ) -> Option<Self> {
        let Self {
            stream,
            config,
            factory,
            peer,
            ..
        } = self;

        let timeout = config.timeout;
        let handshake = stream.into_inner().upgrade_to_tls(tls);
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(stream)) => {
                tracing::debug!(%peer, "STARTTLS handshake complete");
                Some(Self::with_stream(stream, peer, config, factory, handler))
            }
            Ok(Err((err, stream))) => {
                tracing::debug!(%peer, error = %err, "STARTTLS handshake failed");
                handler.session_error(&err);
                Self::with_stream(stream, peer, config, factory, handler)
                    .close()
                    .await;
                None
            }
            // The transport went down with the handshake future.
            Err(_) => {
                handler.session_error(&Error::Timeout(timeout));
                None
            }
        }
    }

    fn extensions(&self) -> Vec<Extension> {
        let mut extensions = vec![
            Extension::Size(self.handler.max_message_size()),
            Extension::EightBitMime,
            Extension::Pipelining,
        ];
        if self.config.tls.is_some() && !self.encrypted {
            extensions.push(Extension::StartTls);
        }
        if self.config.require_auth {
            extensions.push(Extension::Auth(AuthMechanism::SUPPORTED.to_vec()));
        }
        extensions
    }

    fn fail(&mut self, err: &Error) {
        tracing::debug!(peer = %self.peer, error = %err, "SMTP session ended by error");
        self.handler.session_error(err);
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            self.handler.session_error(&err);
        }
    }
}

/// HELO and EHLO take exactly one argument, the client's name.
fn greeting_name(command: &Command) -> Result<&str> {
    match command.fields.as_slice() {
        [_, name] => Ok(name.as_str()),
        _ => Err(Status::INVALID_SYNTAX.into()),
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
    use async_trait::async_trait;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, BufReader, ReadBuf};
    use tokio_test::io::Builder;

    #[derive(Default)]
    struct Recorder {
        errors: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn authenticate(&mut self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }

        async fn message_handler(&mut self, _from: &Address) -> Result<Box<dyn MessageHandler>> {
            Err(Status::new(451, "Try again later").into())
        }

        fn session_error(&mut self, error: &Error) {
            self.errors.lock().unwrap().push(error.to_string());
        }

        fn max_message_size(&self) -> u64 {
            0
        }
    }

    fn session(
        mock: tokio_test::io::Mock,
        errors: &Arc<Mutex<Vec<String>>>,
    ) -> Session<tokio_test::io::Mock> {
        let handler = Recorder {
            errors: Arc::clone(errors),
        };
        let factory = |_: SocketAddr, _: bool| -> Option<Box<dyn SessionHandler>> { None };
        Session::new(
            mock,
            "203.0.113.9:2525".parse().unwrap(),
            Arc::new(Config::new("mx.test")),
            Arc::new(factory),
            Box::new(handler),
        )
    }

    #[tokio::test]
    async fn test_scripted_exchange() {
        let mock = Builder::new()
            .write(b"220 mx.test ESMTP ready\r\n")
            .read(b"NOOP\r\n")
            .write(b"250 Go ahead\r\n")
            .read(b"RCPT TO:<a@b.c>\r\n")
            .write(b"503 Please introduce yourself first\r\n")
            .read(b"HELO client\r\n")
            .write(b"250 Go ahead\r\n")
            .read(b"RCPT TO:<a@b.c>\r\n")
            .write(b"503 Invalid command sequence\r\n")
            .read(b"MAIL FROM:<a@b.c>\r\n")
            .write(b"451 Try again later\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 OK, bye\r\n")
            .build();

        let errors = Arc::default();
        session(mock, &errors).run().await;
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_eof_is_fatal() {
        let mock = Builder::new()
            .write(b"220 mx.test ESMTP ready\r\n")
            .read(b"HELO client\r\n")
            .write(b"250 Go ahead\r\n")
            .build();

        let errors = Arc::default();
        session(mock, &errors).run().await;
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("connection closed"));
    }

    #[tokio::test]
    async fn test_starttls_declined_without_tls() {
        let mock = Builder::new()
            .write(b"220 mx.test ESMTP ready\r\n")
            .read(b"STARTTLS\r\n")
            .write(b"502 TLS not supported\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 OK, bye\r\n")
            .build();

        let errors = Arc::default();
        session(mock, &errors).run().await;
        assert!(errors.lock().unwrap().is_empty());
    }

    /// Stream whose shutdown always fails.
    struct BadClose<S>(S);

    impl<S: AsyncRead + Unpin> AsyncRead for BadClose<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for BadClose<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("close failed")))
        }
    }

    #[tokio::test]
    async fn test_close_failure_is_reported() {
        let mock = Builder::new()
            .write(b"220 mx.test ESMTP ready\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 OK, bye\r\n")
            .build();

        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let handler = Recorder {
            errors: Arc::clone(&errors),
        };
        let factory = |_: SocketAddr, _: bool| -> Option<Box<dyn SessionHandler>> { None };
        Session::new(
            BadClose(mock),
            "203.0.113.9:2525".parse().unwrap(),
            Arc::new(Config::new("mx.test")),
            Arc::new(factory),
            Box::new(handler),
        )
        .run()
        .await;

        assert_eq!(*errors.lock().unwrap(), vec!["I/O error: close failed"]);
    }

    #[tokio::test]
    async fn test_failed_handshake_still_closes_transport() {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let tls = crate::connection::server_config(
            vec![key.cert.der().clone()],
            rustls::pki_types::PrivateKeyDer::Pkcs8(key.signing_key.serialize_der().into()),
        )
        .unwrap();
        let mut config = Config::new("mx.test");
        config.tls = Some(tls);

        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let factory_errors = Arc::clone(&errors);
        let factory = move |_: SocketAddr, encrypted: bool| -> Option<Box<dyn SessionHandler>> {
            assert!(encrypted);
            Some(Box::new(Recorder {
                errors: Arc::clone(&factory_errors),
            }) as Box<dyn SessionHandler>)
        };
        let handler = Recorder {
            errors: Arc::clone(&errors),
        };

        let (client, server) = tokio::io::duplex(4096);
        let session = tokio::spawn(
            Session::new(
                BadClose(server),
                "203.0.113.9:2525".parse().unwrap(),
                Arc::new(config),
                Arc::new(factory),
                Box::new(handler),
            )
            .run(),
        );

        let mut client = BufReader::new(client);
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "220 mx.test ESMTP ready\r\n");
        client.get_mut().write_all(b"STARTTLS\r\n").await.unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(line, "220 Go ahead\r\n");
        client
            .get_mut()
            .write_all(b"this is not a client hello\r\n")
            .await
            .unwrap();

        session.await.unwrap();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[1], "I/O error: close failed");
    }

    #[test]
    fn test_greeting_name() {
        assert_eq!(greeting_name(&Command::parse("EHLO a.b")).unwrap(), "a.b");
        assert!(greeting_name(&Command::parse("EHLO")).is_err());
        assert!(greeting_name(&Command::parse("HELO a b")).is_err());
    }
}
