//! # Chat Client
//!
//! Connects to a relay server, runs the client side of the handshake and
//! registers a nickname. After that, payloads go out as
//! [`RelayMessage::Relay`] and arrive as [`RelayMessage::Deliver`].
//!
//! ```no_run
//! # use cipherlink::{ChatClient, ClientConfig, CryptoEngine};
//! # async fn demo(engine: CryptoEngine) -> cipherlink::ProtocolResult<()> {
//! let config = ClientConfig { nickname: "alice".into(), ..ClientConfig::default() };
//! let mut client = ChatClient::connect(&config, engine).await?;
//! println!("server fingerprint: {}", client.server_fingerprint());
//! client.send_to("bob", b"hello").await?;
//! # Ok(()) }
//! ```

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::crypto::CryptoEngine;
use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::client_handshake;
use crate::message::RelayMessage;
use crate::transport::{Transport, TransportReader, TransportWriter};

/// Registered connection to a relay server
pub struct ChatClient {
    transport: Transport<TcpStream>,
    nickname: String,
    server_fingerprint: String,
}

impl ChatClient {
    /// Connect, handshake and register `config.nickname`
    ///
    /// A refused registration comes back as [`ProtocolError::Rejected`].
    pub async fn connect(config: &ClientConfig, engine: CryptoEngine) -> ProtocolResult<Self> {
        let mut transport = Transport::new(config.server, engine);
        transport.connect().await?;

        if let Err(e) = client_handshake(&mut transport, config.key_exchange).await {
            transport.disconnect().await;
            return Err(e);
        }
        let server_fingerprint = transport.crypto().remote_fingerprint()?;
        info!("Connected to {} ({})", config.server, server_fingerprint);

        let mut client = Self {
            transport,
            nickname: config.nickname.clone(),
            server_fingerprint,
        };

        match client.register().await {
            Ok(()) => Ok(client),
            Err(e) => {
                // Leave cleanly so the server does not keep a zombie around
                if !e.is_disconnect() {
                    let _ = client.end().await;
                }
                Err(e)
            }
        }
    }

    async fn register(&mut self) -> ProtocolResult<()> {
        let request = RelayMessage::Register {
            nickname: self.nickname.clone(),
        };
        self.transport.send(&request.to_bytes()?).await?;

        match self.recv().await? {
            RelayMessage::Registered { nickname } if nickname == self.nickname => {
                info!("Registered as {}", nickname);
                Ok(())
            }
            RelayMessage::Error { reason } => Err(ProtocolError::Rejected(reason)),
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "expected registration reply, got {:?}",
                other
            ))),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Fingerprint of the server's public key, to compare out of band
    pub fn server_fingerprint(&self) -> &str {
        &self.server_fingerprint
    }

    pub fn local_fingerprint(&self) -> ProtocolResult<String> {
        Ok(self.transport.crypto().local_fingerprint()?)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Ask the server to forward `payload` to `nickname`
    pub async fn send_to(&mut self, nickname: &str, payload: &[u8]) -> ProtocolResult<()> {
        self.transport.send(&relay_frame(nickname, payload)?).await
    }

    /// Next message from the server
    pub async fn recv(&mut self) -> ProtocolResult<RelayMessage> {
        let frame = self.transport.recv().await?;
        RelayMessage::from_bytes(&frame)
    }

    /// Say goodbye and close the connection
    pub async fn end(mut self) -> ProtocolResult<()> {
        let sent = match RelayMessage::End.to_bytes() {
            Ok(bytes) => self.transport.send(&bytes).await,
            Err(e) => Err(e),
        };
        self.transport.disconnect().await;
        debug!("Disconnected from {}", self.transport.addr());
        sent
    }

    /// Separate halves so reading and sending can run concurrently
    pub fn split(self) -> ProtocolResult<(Inbox, Outbox)> {
        let (reader, writer) = self.transport.into_split()?;
        Ok((Inbox { reader }, Outbox { writer }))
    }
}

/// Receiving half of a split [`ChatClient`]
pub struct Inbox {
    reader: TransportReader<TcpStream>,
}

impl Inbox {
    pub async fn recv(&mut self) -> ProtocolResult<RelayMessage> {
        let frame = self.reader.recv().await?;
        RelayMessage::from_bytes(&frame)
    }
}

/// Sending half of a split [`ChatClient`]
pub struct Outbox {
    writer: TransportWriter<TcpStream>,
}

impl Outbox {
    pub async fn send_to(&mut self, nickname: &str, payload: &[u8]) -> ProtocolResult<()> {
        self.writer.send(&relay_frame(nickname, payload)?).await
    }

    pub async fn end(mut self) -> ProtocolResult<()> {
        let sent = match RelayMessage::End.to_bytes() {
            Ok(bytes) => self.writer.send(&bytes).await,
            Err(e) => Err(e),
        };
        self.writer.disconnect().await;
        sent
    }
}

fn relay_frame(nickname: &str, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    RelayMessage::Relay {
        to: nickname.to_string(),
        payload: payload.to_vec(),
    }
    .to_bytes()
}
