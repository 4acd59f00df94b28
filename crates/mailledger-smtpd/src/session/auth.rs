//! AUTH LOGIN and AUTH PLAIN (RFC 4954).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Outcome, Session};
use crate::command::Command;
use crate::types::{AuthMechanism, Reply, ReplyCode, Status};
use crate::Result;

/// Client response that aborts an exchange.
const CANCEL: &str = "*";

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(super) async fn auth(&mut self, command: &Command) -> Result<Outcome> {
        let mechanism = command.field(1).ok_or(Status::INVALID_SYNTAX)?;
        let mechanism = AuthMechanism::parse(mechanism).ok_or(Status::UNKNOWN_MECHANISM)?;

        let (username, password) = match mechanism {
            AuthMechanism::Login => self.login().await?,
            AuthMechanism::Plain => self.plain(command.field(2)).await?,
        };

        tracing::debug!(peer = %self.peer, mechanism = mechanism.as_str(), "AUTH credentials received");
        self.handler.authenticate(&username, &password).await?;
        Ok(Outcome::reply(Status::AUTH_SUCCESS))
    }

    async fn login(&mut self) -> Result<(String, String)> {
        let username = self.challenge(&STANDARD.encode("Username:")).await?;
        let username = decode_text(&username)?;
        let password = self.challenge(&STANDARD.encode("Password:")).await?;
        let password = decode_text(&password)?;
        Ok((username, password))
    }

    async fn plain(&mut self, initial: Option<&str>) -> Result<(String, String)> {
        let payload = match initial {
            Some(payload) => payload.to_string(),
            None => self.challenge("").await?,
        };
        let decoded = decode(&payload)?;

        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let [_authzid, authcid, password] = parts.as_slice() else {
            return Err(Status::DECODING_CREDENTIALS.into());
        };
        Ok((utf8(authcid)?, utf8(password)?))
    }

    /// Sends a 334 prompt and reads the client's response line.
    async fn challenge(&mut self, prompt: &str) -> Result<String> {
        self.stream
            .write_reply(&Reply::single(ReplyCode::AUTH_CONTINUE, prompt))
            .await?;
        let response = self.stream.read_line().await?;
        if response.trim() == CANCEL {
            return Err(Status::AUTH_CANCELLED.into());
        }
        Ok(response)
    }
}

fn decode(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload.trim())
        .map_err(|_| Status::DECODING_CREDENTIALS.into())
}

fn decode_text(payload: &str) -> Result<String> {
    utf8(&decode(payload)?)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Status::DECODING_CREDENTIALS.into())
}
