//! Integration tests for the SMTP session engine.
//!
//! Each test drives a real [`Session`] through an in-memory duplex pipe, with
//! recording handlers standing in for the caller's policy.

#![allow(clippy::unwrap_used, clippy::too_many_lines)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
};
use tokio::task::JoinHandle;

use mailledger_smtpd::{
    Address, DataSink, Error, MessageHandler, Result, Server, SessionHandler, Status,
};

const HOSTNAME: &str = "mx.test";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connection(bool),
    Helo(String, bool),
    Auth(String, String),
    Mail(String),
    Rcpt(String),
    Data(Vec<u8>),
    Error(String),
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<Event>>>);

impl Log {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn auths(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Auth(..)))
            .collect()
    }

    fn messages(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Data(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }
}

/// How the data sink ends the DATA phase.
#[derive(Debug, Clone, Copy, Default)]
enum Finalize {
    #[default]
    Accept,
    Reject,
    Fatal,
}

struct Policy {
    log: Log,
    finalize: Finalize,
}

#[async_trait]
impl SessionHandler for Policy {
    async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        self.log
            .push(Event::Auth(username.to_string(), password.to_string()));
        if password == "secret" {
            Ok(())
        } else {
            Err(Status::new(535, "Authentication credentials invalid").into())
        }
    }

    async fn message_handler(&mut self, from: &Address) -> Result<Box<dyn MessageHandler>> {
        self.log.push(Event::Mail(from.to_string()));
        if from.domain() == "blocked.test" {
            return Err(Status::new(550, "Sender rejected").into());
        }
        Ok(Box::new(Message {
            log: self.log.clone(),
            finalize: self.finalize,
        }))
    }

    async fn helo(&mut self, name: &str, extended: bool) -> Result<()> {
        self.log.push(Event::Helo(name.to_string(), extended));
        if name == "spammer" {
            return Err(Status::new(550, "Go away").into());
        }
        Ok(())
    }

    fn session_error(&mut self, error: &Error) {
        self.log.push(Event::Error(error.to_string()));
    }

    fn max_message_size(&self) -> u64 {
        1024
    }
}

struct Message {
    log: Log,
    finalize: Finalize,
}

#[async_trait]
impl MessageHandler for Message {
    async fn add_recipient(&mut self, recipient: &Address) -> Result<()> {
        self.log.push(Event::Rcpt(recipient.to_string()));
        if recipient.local_part() == "nobody" {
            return Err(Status::new(550, "No such user").into());
        }
        Ok(())
    }

    async fn data_writer(&mut self) -> Result<DataSink> {
        Ok(Box::new(Capture {
            log: self.log.clone(),
            finalize: self.finalize,
            body: Vec::new(),
        }))
    }
}

struct Capture {
    log: Log,
    finalize: Finalize,
    body: Vec<u8>,
}

impl AsyncWrite for Capture {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.body.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(match self.finalize {
            Finalize::Accept => {
                self.log.push(Event::Data(self.body.clone()));
                Ok(())
            }
            Finalize::Reject => Err(io::Error::other(Status::new(554, "Transaction failed"))),
            Finalize::Fatal => Err(io::Error::other("spool unavailable")),
        })
    }
}

#[derive(Default)]
struct Options {
    tls: Option<Arc<rustls::ServerConfig>>,
    require_tls: bool,
    require_auth: bool,
    finalize: Finalize,
    timeout: Option<Duration>,
    decline_encrypted: bool,
}

/// Client end of a session.
struct Client<S> {
    stream: BufReader<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn send(&mut self, data: &str) {
        self.stream.get_mut().write_all(data.as_bytes()).await.unwrap();
    }

    /// Reads one complete, possibly multi-line, reply.
    async fn reply(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");
            let line = line.trim_end_matches("\r\n").to_string();
            let last = line.len() < 4 || line.as_bytes()[3] == b' ';
            lines.push(line);
            if last {
                return lines;
            }
        }
    }

    /// Sends a command and returns the last line of its reply.
    async fn cmd(&mut self, line: &str) -> String {
        self.send(&format!("{line}\r\n")).await;
        self.reply().await.pop().unwrap()
    }

    /// Reads until the server closes the connection and returns whatever
    /// arrived in the meantime.
    async fn remaining(&mut self) -> Vec<u8> {
        let mut rest = Vec::new();
        let _ = self.stream.read_to_end(&mut rest).await;
        rest
    }

    fn into_inner(self) -> S {
        assert!(self.stream.buffer().is_empty());
        self.stream.into_inner()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Spawns a session and reads its greeting.
async fn start(options: Options) -> (Client<DuplexStream>, Log, JoinHandle<()>) {
    init_tracing();
    let log = Log::default();

    let factory_log = log.clone();
    let finalize = options.finalize;
    let decline_encrypted = options.decline_encrypted;
    let mut builder = Server::builder(HOSTNAME)
        .require_tls(options.require_tls)
        .require_auth(options.require_auth)
        .on_connection(move |_peer, encrypted| {
            factory_log.push(Event::Connection(encrypted));
            if encrypted && decline_encrypted {
                return None;
            }
            Some(Box::new(Policy {
                log: factory_log.clone(),
                finalize,
            }) as Box<dyn SessionHandler>)
        });
    if let Some(tls) = options.tls {
        builder = builder.tls(tls);
    }
    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }
    let server = builder.build().unwrap();

    let (client, server_side) = tokio::io::duplex(64 * 1024);
    let handle = server
        .spawn(server_side, "198.51.100.7:52000".parse().unwrap())
        .unwrap();

    let mut client = Client::new(client);
    assert_eq!(client.reply().await, vec![format!("220 {HOSTNAME} ESMTP ready")]);
    (client, log, handle)
}

async fn greeted(options: Options) -> (Client<DuplexStream>, Log, JoinHandle<()>) {
    let (mut client, log, handle) = start(options).await;
    assert_eq!(client.cmd("HELO client.test").await, "250 Go ahead");
    (client, log, handle)
}

fn tls_pair() -> (Arc<rustls::ServerConfig>, tokio_rustls::TlsConnector) {
    let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server = mailledger_smtpd::connection::server_config(
        vec![key.cert.der().clone()],
        rustls::pki_types::PrivateKeyDer::Pkcs8(key.signing_key.serialize_der().into()),
    )
    .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(key.cert.der().clone()).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (server, tokio_rustls::TlsConnector::from(Arc::new(client)))
}

mod greeting {
    use super::*;

    #[tokio::test]
    async fn test_mail_requires_greeting() {
        let (mut client, log, _) = start(Options::default()).await;
        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "503 Please introduce yourself first"
        );
        assert_eq!(client.cmd("AUTH PLAIN").await, "503 Please introduce yourself first");
        assert_eq!(client.cmd("NOOP").await, "250 Go ahead");

        assert_eq!(client.cmd("HELO client.test").await, "250 Go ahead");
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(
            log.events(),
            vec![
                Event::Connection(false),
                Event::Helo("client.test".to_string(), false),
                Event::Mail("alice@example.com".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_greeting_needs_exactly_one_argument() {
        let (mut client, _, _) = start(Options::default()).await;
        assert_eq!(client.cmd("HELO").await, "501 Invalid syntax");
        assert_eq!(client.cmd("EHLO a b").await, "501 Invalid syntax");
        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "503 Please introduce yourself first"
        );
    }

    #[tokio::test]
    async fn test_rejected_helo_keeps_session_ungreeted() {
        let (mut client, _, _) = start(Options::default()).await;
        assert_eq!(client.cmd("HELO spammer").await, "550 Go away");
        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "503 Please introduce yourself first"
        );
    }

    #[tokio::test]
    async fn test_ehlo_reply() {
        let (mut client, log, _) = start(Options::default()).await;
        client.send("ehlo client.test\r\n").await;
        assert_eq!(
            client.reply().await,
            vec![
                "250-mx.test Hello client.test",
                "250-SIZE 1024",
                "250-8BITMIME",
                "250 PIPELINING",
            ]
        );
        assert!(log.events().contains(&Event::Helo("client.test".to_string(), true)));
    }

    #[tokio::test]
    async fn test_ehlo_advertises_starttls_and_auth() {
        let (tls, _) = tls_pair();
        let (mut client, _, _) = start(Options {
            tls: Some(tls),
            require_auth: true,
            ..Options::default()
        })
        .await;

        client.send("EHLO client.test\r\n").await;
        let reply = client.reply().await;
        let (last, rest) = reply.split_last().unwrap();
        assert!(rest.iter().all(|line| line.starts_with("250-")));
        assert_eq!(last, "250 AUTH PLAIN LOGIN");
        assert_eq!(reply.iter().filter(|l| l.ends_with("STARTTLS")).count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_empty_commands() {
        let (mut client, _, _) = start(Options::default()).await;
        assert_eq!(client.cmd("VRFY alice").await, "502 Unsupported command");
        assert_eq!(client.cmd("").await, "502 Unsupported command");
        assert_eq!(client.cmd("noop").await, "250 Go ahead");
    }

    #[tokio::test]
    async fn test_quit() {
        let (mut client, log, handle) = start(Options::default()).await;
        assert_eq!(client.cmd("QUIT").await, "221 OK, bye");
        assert!(client.remaining().await.is_empty());
        handle.await.unwrap();
        assert!(log.errors().is_empty());
    }
}

mod transaction {
    use super::*;

    #[tokio::test]
    async fn test_full_transaction() {
        let (mut client, log, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("rcpt to:<carol@example.com>").await, "250 Go ahead");
        assert_eq!(
            client.cmd("DATA").await,
            "354 Go ahead. End your data with <CR><LF>.<CR><LF>"
        );
        client
            .send("Subject: hi\r\n\r\n..leading dot\r\nbody\r\n.\r\n")
            .await;
        assert_eq!(client.reply().await, vec!["250 Thank you"]);

        assert_eq!(
            log.messages(),
            vec![b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n".to_vec()]
        );

        // One DATA per MAIL.
        assert_eq!(client.cmd("DATA").await, "503 Invalid command sequence");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "503 Invalid command sequence");
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let (mut client, log, _) = start(Options::default()).await;
        client
            .send("HELO client.test\r\nMAIL FROM:<alice@example.com>\r\nRCPT TO:<bob@example.com>\r\nDATA\r\n")
            .await;
        assert_eq!(client.reply().await, vec!["250 Go ahead"]);
        assert_eq!(client.reply().await, vec!["250 Go ahead"]);
        assert_eq!(client.reply().await, vec!["250 Go ahead"]);
        assert!(client.reply().await[0].starts_with("354 "));

        client.send("hello\r\n.\r\n").await;
        assert_eq!(client.reply().await, vec!["250 Thank you"]);
        assert_eq!(log.messages(), vec![b"hello\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_handler_rejections_are_reported() {
        let (mut client, _, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("MAIL FROM:<eve@blocked.test>").await, "550 Sender rejected");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "503 Invalid command sequence");

        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<nobody@example.com>").await, "550 No such user");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "250 Go ahead");
    }

    #[tokio::test]
    async fn test_malformed_addresses() {
        let (mut client, log, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("MAIL FROM:foo@bar").await, "501 Malformed email address");
        assert_eq!(client.cmd("MAIL FROM:<foo@bar>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:foo@bar").await, "501 Malformed email address");
        assert_eq!(client.cmd("RCPT TO:<foo@bar>").await, "250 Go ahead");

        let events = log.events();
        assert!(events.contains(&Event::Mail("foo@bar".to_string())));
        assert!(events.contains(&Event::Rcpt("foo@bar".to_string())));
    }

    #[tokio::test]
    async fn test_missing_or_wrong_parameter() {
        let (mut client, _, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("MAIL").await, "501 Invalid syntax");
        assert_eq!(client.cmd("MAIL FROM:").await, "501 Invalid syntax");
        assert_eq!(client.cmd("MAIL TO:<alice@example.com>").await, "501 Invalid syntax");
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT FROM:<bob@example.com>").await, "501 Invalid syntax");
    }

    #[tokio::test]
    async fn test_rset() {
        let (mut client, log, _) = start(Options::default()).await;
        assert_eq!(client.cmd("RSET").await, "250 Go ahead");

        assert_eq!(client.cmd("HELO client.test").await, "250 Go ahead");
        assert_eq!(client.cmd("RSET").await, "250 Go ahead");
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RSET").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "503 Invalid command sequence");
        assert_eq!(client.cmd("DATA").await, "503 Invalid command sequence");
        assert!(log.messages().is_empty());
    }

    #[tokio::test]
    async fn test_regreeting_clears_transaction() {
        let (mut client, _, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("HELO client.test").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "503 Invalid command sequence");
    }

    #[tokio::test]
    async fn test_rejected_finalize_clears_transaction() {
        let (mut client, log, _) = greeted(Options {
            finalize: Finalize::Reject,
            ..Options::default()
        })
        .await;
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "250 Go ahead");
        assert!(client.cmd("DATA").await.starts_with("354 "));
        client.send("body\r\n.\r\n").await;
        assert_eq!(client.reply().await, vec!["554 Transaction failed"]);

        assert!(log.messages().is_empty());
        assert_eq!(client.cmd("RCPT TO:<bob@example.com>").await, "503 Invalid command sequence");
        assert_eq!(client.cmd("DATA").await, "503 Invalid command sequence");
    }

    #[tokio::test]
    async fn test_fatal_finalize_ends_session() {
        let (mut client, log, handle) = greeted(Options {
            finalize: Finalize::Fatal,
            ..Options::default()
        })
        .await;
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert!(client.cmd("DATA").await.starts_with("354 "));
        client.send("body\r\n.\r\n").await;

        assert!(client.remaining().await.is_empty());
        handle.await.unwrap();
        assert!(log.messages().is_empty());
        assert_eq!(log.errors(), vec!["I/O error: spool unavailable".to_string()]);
    }

    #[tokio::test]
    async fn test_require_tls_blocks_mail() {
        let (mut client, _, _) = greeted(Options {
            require_tls: true,
            ..Options::default()
        })
        .await;
        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "503 please start TLS 1st"
        );
    }
}

mod auth {
    use super::*;

    fn auth_options() -> Options {
        Options {
            require_auth: true,
            ..Options::default()
        }
    }

    #[tokio::test]
    async fn test_plain_inline_and_interactive_agree() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(
            client.cmd("AUTH PLAIN AGFsaWNlAHNlY3JldA==").await,
            "235 OK, you are now authenticated"
        );

        assert_eq!(client.cmd("AUTH plain").await, "334 ");
        assert_eq!(
            client.cmd("AGFsaWNlAHNlY3JldA==").await,
            "235 OK, you are now authenticated"
        );

        let expected = Event::Auth("alice".to_string(), "secret".to_string());
        assert_eq!(log.auths(), vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn test_plain_ignores_authorization_identity() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(
            client.cmd("AUTH PLAIN YWRtaW4AYWxpY2UAc2VjcmV0").await,
            "235 OK, you are now authenticated"
        );
        assert_eq!(
            log.auths(),
            vec![Event::Auth("alice".to_string(), "secret".to_string())]
        );
    }

    #[tokio::test]
    async fn test_plain_decoding_failures() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(
            client.cmd("AUTH PLAIN AGFsaWNl").await,
            "501 Couldn't decode your credentials"
        );
        assert_eq!(
            client.cmd("AUTH PLAIN !!!").await,
            "501 Couldn't decode your credentials"
        );
        assert_eq!(
            client.cmd("AUTH PLAIN AGFsaWNlAP8=").await,
            "501 Couldn't decode your credentials"
        );
        assert!(log.auths().is_empty());
        assert_eq!(client.cmd("NOOP").await, "250 Go ahead");
    }

    #[tokio::test]
    async fn test_login() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.cmd("YWxpY2U=").await, "334 UGFzc3dvcmQ6");
        assert_eq!(client.cmd("c2VjcmV0").await, "235 OK, you are now authenticated");
        assert_eq!(
            log.auths(),
            vec![Event::Auth("alice".to_string(), "secret".to_string())]
        );
    }

    #[tokio::test]
    async fn test_login_bad_base64() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(
            client.cmd("not base64").await,
            "501 Couldn't decode your credentials"
        );
        assert!(log.auths().is_empty());
        assert_eq!(client.cmd("NOOP").await, "250 Go ahead");
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let (mut client, _, _) = greeted(auth_options()).await;
        // "\0alice\0wrong"
        assert_eq!(
            client.cmd("AUTH PLAIN AGFsaWNlAHdyb25n").await,
            "535 Authentication credentials invalid"
        );
    }

    #[tokio::test]
    async fn test_cancel() {
        let (mut client, log, _) = greeted(auth_options()).await;
        assert_eq!(client.cmd("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.cmd("*").await, "501 Authentication cancelled");
        assert!(log.auths().is_empty());
    }

    #[tokio::test]
    async fn test_mechanism_errors() {
        let (mut client, _, _) = greeted(auth_options()).await;
        assert_eq!(client.cmd("AUTH").await, "501 Invalid syntax");
        assert_eq!(
            client.cmd("AUTH CRAM-MD5").await,
            "502 Unknown authentication mechanism"
        );
    }
}

mod starttls {
    use super::*;

    #[tokio::test]
    async fn test_not_configured() {
        let (mut client, _, _) = greeted(Options::default()).await;
        assert_eq!(client.cmd("STARTTLS").await, "502 TLS not supported");
    }

    #[tokio::test]
    async fn test_declined_after_starttls_hangs_up() {
        let (tls, _) = tls_pair();
        let (mut client, log, handle) = start(Options {
            tls: Some(tls),
            decline_encrypted: true,
            ..Options::default()
        })
        .await;

        assert_eq!(client.cmd("EHLO client.test").await, "250 STARTTLS");
        assert_eq!(client.cmd("STARTTLS").await, "220 Go ahead");
        assert!(client.remaining().await.is_empty());
        handle.await.unwrap();

        let connections: Vec<Event> = log
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Connection(_)))
            .collect();
        assert_eq!(connections, vec![Event::Connection(false), Event::Connection(true)]);
        assert!(log.errors().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_then_second_starttls_rejected() {
        let (tls, connector) = tls_pair();
        let (mut client, log, handle) = start(Options {
            tls: Some(tls),
            require_tls: true,
            ..Options::default()
        })
        .await;

        assert_eq!(client.cmd("EHLO client.test").await, "250 STARTTLS");
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "503 please start TLS 1st");
        assert_eq!(client.cmd("STARTTLS").await, "220 Go ahead");

        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
        let stream = connector
            .connect(server_name, client.into_inner())
            .await
            .unwrap();
        let mut client = Client::new(stream);

        // A fresh session: no greeting carried over, no new banner.
        assert_eq!(
            client.cmd("MAIL FROM:<alice@example.com>").await,
            "503 Please introduce yourself first"
        );
        client.send("EHLO client.test\r\n").await;
        let reply = client.reply().await;
        assert!(reply.iter().all(|line| !line.contains("STARTTLS")));

        assert_eq!(client.cmd("STARTTLS").await, "501 already running TLS");
        assert_eq!(client.cmd("MAIL FROM:<alice@example.com>").await, "250 Go ahead");
        assert_eq!(client.cmd("QUIT").await, "221 OK, bye");
        assert!(client.remaining().await.is_empty());
        handle.await.unwrap();

        let connections: Vec<Event> = log
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Connection(_)))
            .collect();
        assert_eq!(connections, vec![Event::Connection(false), Event::Connection(true)]);
    }

    #[tokio::test]
    async fn test_failed_handshake_ends_session() {
        let (tls, _) = tls_pair();
        let (mut client, log, handle) = greeted(Options {
            tls: Some(tls),
            ..Options::default()
        })
        .await;
        assert_eq!(client.cmd("STARTTLS").await, "220 Go ahead");
        client.send("this is not a TLS client hello\r\n").await;

        // At most a TLS alert, then the connection is gone.
        client.remaining().await;
        handle.await.unwrap();
        assert_eq!(log.errors().len(), 1);
    }
}

mod failures {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (mut client, log, handle) = start(Options {
            timeout: Some(Duration::from_secs(30)),
            ..Options::default()
        })
        .await;

        assert!(client.remaining().await.is_empty());
        handle.await.unwrap();
        assert_eq!(log.errors(), vec!["Read timed out after 30s".to_string()]);
    }

    #[tokio::test]
    async fn test_client_disconnect_is_reported() {
        let (client, log, handle) = start(Options::default()).await;
        drop(client);
        handle.await.unwrap();
        assert_eq!(log.errors().len(), 1);
    }
}

/// Commands that never open a transaction.
fn no_mail_command() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "RCPT TO:<bob@example.com>",
        "DATA",
        "NOOP",
        "RSET",
        "EHLO client.test",
        "HELO client.test",
        "VRFY bob",
        "MAIL FROM:bob@example.com",
        "MAIL FROM:<eve@blocked.test>",
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn rcpt_and_data_without_mail_are_bad_sequence(
        commands in prop::collection::vec(no_mail_command(), 0..12)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (mut client, log, handle) = start(Options::default()).await;
            for command in &commands {
                let reply = client.cmd(command).await;
                if command.starts_with("RCPT") || *command == "DATA" {
                    assert!(reply.starts_with("503 "), "{command} -> {reply}");
                }
            }
            assert_eq!(client.cmd("QUIT").await, "221 OK, bye");
            handle.await.unwrap();
            assert!(log.messages().is_empty());
            assert!(log.errors().is_empty());
        });
    }
}
