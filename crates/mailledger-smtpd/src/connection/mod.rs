//! Connection plumbing: framing, plaintext/TLS transport, TLS material.

mod framed;
mod stream;
mod tls;

pub use framed::{FramedStream, MAX_LINE_LENGTH};
pub use stream::SmtpStream;
pub use tls::{load_server_config, server_config};
