//! Sender side of the protocol, as a server list would speak it.
//!
//! Used for end-to-end testing and for relaying votes between listeners.

use crate::core::envelope::StatusReply;
use crate::core::vote::Vote;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::ServerGreeting;
use crate::protocol::{v1, v2};
use crate::utils::timeout::{with_timeout_error, DEFAULT_TIMEOUT};
use rsa::RsaPublicKey;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Connection settings for sending votes
#[derive(Debug, Clone)]
pub struct VoteClient {
    addr: String,
    timeout: Duration,
}

impl VoteClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Budget for a whole exchange, connect to close
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `vote` over the RSA block protocol.
    ///
    /// Returns once the listener has closed the connection.
    #[instrument(skip(self, public, vote), fields(addr = %self.addr))]
    pub async fn send_v1(&self, vote: &Vote, public: &RsaPublicKey) -> Result<()> {
        let block = v1::encode(vote, public)?;
        with_timeout_error(
            async {
                let (mut reader, _greeting) = self.connect().await?;
                reader.get_mut().write_all(&block).await?;
                reader.get_mut().flush().await?;

                // The listener closes after dispatching; anything it sends is
                // ignored.
                let mut rest = Vec::new();
                reader.read_to_end(&mut rest).await?;
                debug!("V1 vote sent");
                Ok(())
            },
            self.timeout,
        )
        .await
    }

    /// Send `vote` over the token protocol and wait for `{"status":"ok"}`.
    #[instrument(skip(self, secret, vote), fields(addr = %self.addr))]
    pub async fn send_v2(
        &self,
        vote: &Vote,
        token_identifier: Option<&str>,
        secret: &[u8],
    ) -> Result<()> {
        with_timeout_error(
            async {
                let (mut reader, greeting) = self.connect().await?;
                let challenge = greeting.challenge.ok_or_else(|| {
                    ProtocolError::HandshakeError(constants::ERR_NO_CHALLENGE.into())
                })?;

                let frame = v2::encode(vote, token_identifier, secret, &challenge)?;
                reader.get_mut().write_all(&frame).await?;
                reader.get_mut().flush().await?;

                let mut line = String::new();
                if reader.read_line(&mut line).await? == 0 {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_SERVER_REJECTED.into(),
                    ));
                }
                if !StatusReply::parse(&line)?.is_ok() {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_SERVER_REJECTED.into(),
                    ));
                }
                debug!("V2 vote acknowledged");
                Ok(())
            },
            self.timeout,
        )
        .await
    }

    async fn connect(&self) -> Result<(BufReader<TcpStream>, ServerGreeting)> {
        let stream = TcpStream::connect(&self.addr).await?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        let greeting = ServerGreeting::parse(&line)?;
        debug!(version = %greeting.version, "Greeting received");
        Ok((reader, greeting))
    }
}

/// Send one V1 vote to `addr`.
pub async fn send_v1_vote(addr: &str, vote: &Vote, public: &RsaPublicKey) -> Result<()> {
    VoteClient::new(addr).send_v1(vote, public).await
}

/// Send one V2 vote to `addr`.
pub async fn send_v2_vote(
    addr: &str,
    vote: &Vote,
    token_identifier: Option<&str>,
    secret: &[u8],
) -> Result<()> {
    VoteClient::new(addr)
        .send_v2(vote, token_identifier, secret)
        .await
}
