//! Framed I/O for the server side of SMTP.
//!
//! Commands and replies are CRLF-terminated lines. Message content after
//! DATA is a dot-terminated block: lines starting with `.` have been stuffed
//! with an extra dot by the client and a line holding a single `.` ends it.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::types::Reply;
use crate::{Error, Result};

/// Default buffer size for reading.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Maximum command line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Framed connection for the SMTP server.
///
/// Every read is bounded by the idle timeout; writes are flushed immediately.
pub struct FramedStream<S> {
    reader: BufReader<S>,
    timeout: Duration,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new framed stream with the given idle timeout.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, stream),
            timeout,
        }
    }

    /// Returns the idle timeout applied to reads.
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reads one command line and strips its terminator.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let limit = MAX_LINE_LENGTH as u64 + 2;
        let timeout = self.timeout;
        let reader = &mut self.reader;

        let n = with_timeout(timeout, reader.take(limit).read_until(b'\n', &mut line)).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        if !line.ends_with(b"\n") {
            return Err(if n as u64 >= limit {
                Error::Protocol("line too long".to_string())
            } else {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                ))
            });
        }

        Ok(String::from_utf8_lossy(strip_terminator(&line)).into_owned())
    }

    /// Copies a dot-terminated message body into `sink`.
    ///
    /// Stuffed dots are removed and line endings are kept as sent. If the
    /// sink fails, the rest of the body is still consumed so the command
    /// stream stays in sync, and the sink's error is returned afterwards.
    /// Returns the number of bytes written to the sink.
    pub async fn read_data<W>(&mut self, sink: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut line = Vec::with_capacity(DEFAULT_BUFFER_SIZE);
        let mut at_line_start = true;
        let mut written = 0u64;
        let mut sink_error: Option<io::Error> = None;
        let timeout = self.timeout;

        loop {
            line.clear();
            let reader = &mut self.reader;
            let n = with_timeout(
                timeout,
                reader.take(MAX_LINE_LENGTH as u64).read_until(b'\n', &mut line),
            )
            .await?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                )));
            }

            if at_line_start && strip_terminator(&line) == b"." && line.ends_with(b"\n") {
                break;
            }

            let payload = if at_line_start && line.starts_with(b".") {
                &line[1..]
            } else {
                &line[..]
            };
            at_line_start = line.ends_with(b"\n");

            if sink_error.is_none() {
                match sink.write_all(payload).await {
                    Ok(()) => written += payload.len() as u64,
                    Err(err) => sink_error = Some(err),
                }
            }
        }

        match sink_error {
            Some(err) => Err(err.into()),
            None => Ok(written),
        }
    }

    /// Writes a reply and flushes it.
    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&reply.serialize()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.reader.get_mut().shutdown().await?;
        Ok(())
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// Consumes the framed stream and returns the inner stream.
    ///
    /// Any buffered input is dropped. After STARTTLS this discards plaintext
    /// the client pipelined behind the command.
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

/// Bounds a read by the idle timeout.
async fn with_timeout<T>(
    timeout: Duration,
    read: impl Future<Output = io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, read).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(timeout)),
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
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
    use crate::types::{ReplyCode, Status};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn framed(input: &[u8]) -> (FramedStream<DuplexStream>, DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        client.write_all(input).await.unwrap();
        (FramedStream::new(server, TIMEOUT), client)
    }

    #[tokio::test]
    async fn test_read_lines() {
        let (mut framed, _client) = framed(b"EHLO a\r\nNOOP\nQUIT\r\n").await;
        assert_eq!(framed.read_line().await.unwrap(), "EHLO a");
        assert_eq!(framed.read_line().await.unwrap(), "NOOP");
        assert_eq!(framed.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let (mut framed, client) = framed(b"").await;
        drop(client);
        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let mut input = vec![b'A'; MAX_LINE_LENGTH + 10];
        input.extend_from_slice(b"\r\n");
        let (mut framed, _client) = framed(&input).await;
        assert!(matches!(
            framed.read_line().await.unwrap_err(),
            Error::Protocol(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_line_timeout() {
        let (client, server) = tokio::io::duplex(64);
        let mut framed = FramedStream::new(server, Duration::from_secs(30));
        let err = framed.read_line().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(30)));
        drop(client);
    }

    #[tokio::test]
    async fn test_read_data_unstuffs() {
        let (mut framed, _client) =
            framed(b"Subject: hi\r\n\r\n..leading dot\r\n.\r\nQUIT\r\n").await;
        let mut sink = Vec::new();
        let n = framed.read_data(&mut sink).await.unwrap();
        assert_eq!(sink, b"Subject: hi\r\n\r\n.leading dot\r\n");
        assert_eq!(n, sink.len() as u64);
        assert_eq!(framed.read_line().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_read_data_empty_body() {
        let (mut framed, _client) = framed(b".\r\n").await;
        let mut sink = Vec::new();
        assert_eq!(framed.read_data(&mut sink).await.unwrap(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_read_data_dot_inside_line() {
        let (mut framed, _client) = framed(b"a.\r\n .\r\n.\r\n").await;
        let mut sink = Vec::new();
        framed.read_data(&mut sink).await.unwrap();
        assert_eq!(sink, b"a.\r\n .\r\n");
    }

    #[tokio::test]
    async fn test_read_data_long_line_in_pieces() {
        let mut input = vec![b'.'; MAX_LINE_LENGTH + 3];
        input.extend_from_slice(b"\r\n.\r\n");
        let (mut framed, _client) = framed(&input).await;
        let mut sink = Vec::new();
        framed.read_data(&mut sink).await.unwrap();
        // Only the first dot of the line is a stuffing dot.
        assert_eq!(sink.len(), MAX_LINE_LENGTH + 2 + 2);
        assert!(sink.ends_with(b".\r\n"));
    }

    #[tokio::test]
    async fn test_read_data_eof() {
        let (mut framed, client) = framed(b"partial body\r\n").await;
        drop(client);
        let mut sink = Vec::new();
        assert!(matches!(
            framed.read_data(&mut sink).await.unwrap_err(),
            Error::Io(_)
        ));
    }

    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other(Status::new(552, "Too much mail"))))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_data_sink_failure_drains_body() {
        let (mut framed, _client) = framed(b"line one\r\nline two\r\n.\r\nNOOP\r\n").await;
        let err = framed.read_data(&mut FailingSink).await.unwrap_err();
        match err {
            Error::Status(status) => assert_eq!(status.code, ReplyCode::EXCEEDED_STORAGE),
            other => panic!("expected status, got {other:?}"),
        }
        assert_eq!(framed.read_line().await.unwrap(), "NOOP");
    }

    #[tokio::test]
    async fn test_write_reply() {
        let (mut framed, mut client) = framed(b"").await;
        framed
            .write_reply(&Reply::from(Status::GO_AHEAD))
            .await
            .unwrap();
        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"250 Go ahead\r\n");
    }
}
