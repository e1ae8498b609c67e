//! # Protocol Handshake
//!
//! Runs once per connection, right after the transport connects. Frames are
//! positional: each side knows what the next one carries by counting.
//!
//! ## RSA key exchange
//!
//! ```text
//! Server                                   Client
//!   |------- server public key (plain) ------>|
//!   |<------ client public key (plain) -------|
//!   |   [both switch to ASYMMETRIC]           |
//!   |------- AES key   (RSA-OAEP) ----------->|
//!   |------- AES IV    (RSA-OAEP) ----------->|
//!   |------- AES salt  (RSA-OAEP) ----------->|
//!   |   [both switch to SYMMETRIC]            |
//! ```
//!
//! ## Diffie-Hellman key exchange
//!
//! Public keys are exchanged the same way (they still provide fingerprints),
//! then the DH public values travel in plain text and each side derives the
//! session context itself. Nothing secret crosses the wire, which buys
//! forward secrecy; the RSA keys no longer vouch for the session material.
//!
//! On any failure the engine's session keys are discarded and the transport
//! drops back to plain mode, so a retry always starts from scratch.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::cipher::SymmetricContext;
use crate::dh;
use crate::error::{CryptoError, ProtocolResult};
use crate::transport::{EncryptionMode, Transport};

/// Which side of the handshake this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: sends its key first and chooses the session key
    Server,
    /// Responder
    Client,
}

/// How the session key is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyExchange {
    /// Server picks the AES context and sends it under RSA-OAEP
    #[default]
    Rsa,
    /// Both sides derive the AES context from a DH shared secret
    DiffieHellman,
}

impl fmt::Display for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa => write!(f, "rsa"),
            Self::DiffieHellman => write!(f, "diffie_hellman"),
        }
    }
}

/// Run the handshake for `role`
pub async fn perform_handshake<S>(
    transport: &mut Transport<S>,
    role: Role,
    key_exchange: KeyExchange,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match role {
        Role::Server => run_server(transport, key_exchange).await,
        Role::Client => run_client(transport, key_exchange).await,
    };

    if let Err(ref e) = result {
        warn!("Handshake with {} failed: {}", transport.addr(), e);
        transport.crypto_mut().discard_session_keys();
        transport.set_mode(EncryptionMode::None);
    } else {
        debug!("Handshake with {} complete ({})", transport.addr(), key_exchange);
    }
    result
}

/// Server side of the handshake
///
/// For [`KeyExchange::Rsa`] the engine must already hold the symmetric
/// context to hand out.
pub async fn server_handshake<S>(
    transport: &mut Transport<S>,
    key_exchange: KeyExchange,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    perform_handshake(transport, Role::Server, key_exchange).await
}

/// Client side of the handshake
pub async fn client_handshake<S>(
    transport: &mut Transport<S>,
    key_exchange: KeyExchange,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    perform_handshake(transport, Role::Client, key_exchange).await
}

async fn run_server<S>(transport: &mut Transport<S>, key_exchange: KeyExchange) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local_key = transport.crypto().local_public_key_pem()?;
    transport.send(local_key.as_bytes()).await?;

    let remote_key = transport.recv().await?;
    transport.crypto_mut().set_remote_public_key_pem(&remote_key)?;

    match key_exchange {
        KeyExchange::Rsa => {
            transport.set_mode(EncryptionMode::Asymmetric);

            let (key, iv, salt) = {
                let ctx = transport
                    .crypto()
                    .symmetric()
                    .ok_or(CryptoError::SymmetricKeyNotSet)?;
                (ctx.key().to_vec(), ctx.iv().to_vec(), ctx.salt().to_vec())
            };
            transport.send(&key).await?;
            transport.send(&iv).await?;
            transport.send(&salt).await?;
        }
        KeyExchange::DiffieHellman => {
            transport.crypto_mut().generate_dh_key_pair();
            let local_value = dh::encode_public_value(transport.crypto().dh_public_value()?);
            transport.send(&local_value).await?;

            let remote_value = dh::decode_public_value(&transport.recv().await?)?;
            transport.crypto_mut().compute_dh_secret(&remote_value)?;
        }
    }

    transport.set_mode(EncryptionMode::Symmetric);
    Ok(())
}

async fn run_client<S>(transport: &mut Transport<S>, key_exchange: KeyExchange) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote_key = transport.recv().await?;
    transport.crypto_mut().set_remote_public_key_pem(&remote_key)?;

    let local_key = transport.crypto().local_public_key_pem()?;
    transport.send(local_key.as_bytes()).await?;

    match key_exchange {
        KeyExchange::Rsa => {
            transport.set_mode(EncryptionMode::Asymmetric);

            let key = transport.recv().await?;
            let iv = transport.recv().await?;
            let salt = transport.recv().await?;
            let ctx = SymmetricContext::from_parts(key, iv, salt)?;
            transport.crypto_mut().install_symmetric(ctx);
        }
        KeyExchange::DiffieHellman => {
            let remote_value = dh::decode_public_value(&transport.recv().await?)?;

            transport.crypto_mut().generate_dh_key_pair();
            let local_value = dh::encode_public_value(transport.crypto().dh_public_value()?);
            transport.send(&local_value).await?;

            transport.crypto_mut().compute_dh_secret(&remote_value)?;
        }
    }

    transport.set_mode(EncryptionMode::Symmetric);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherMode;
    use crate::crypto::{test_key_pair, CryptoEngine};
    use crate::error::{NetworkError, ProtocolError};
    use crate::frame;
    use std::net::SocketAddr;
    use tokio::io::{duplex, DuplexStream};

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn transports(mode: CipherMode) -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let (a, b) = duplex(4096);
        let mut server_engine = CryptoEngine::with_key_pair(test_key_pair(0));
        server_engine.generate_symmetric_key(mode);
        let client_engine = CryptoEngine::with_key_pair(test_key_pair(1));
        (
            Transport::from_stream(a, addr(), server_engine),
            Transport::from_stream(b, addr(), client_engine),
        )
    }

    async fn run_both(
        mut server: Transport<DuplexStream>,
        mut client: Transport<DuplexStream>,
        key_exchange: KeyExchange,
    ) -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, key_exchange).await.unwrap();
            server
        });
        client_handshake(&mut client, key_exchange).await.unwrap();
        (server_task.await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_rsa_handshake_converges() {
        for mode in [CipherMode::Aes128Cbc, CipherMode::Aes256Cbc] {
            let (server, client) = transports(mode);
            let (mut server, mut client) = run_both(server, client, KeyExchange::Rsa).await;

            let s = server.crypto().symmetric().unwrap();
            let c = client.crypto().symmetric().unwrap();
            assert_eq!(s.key(), c.key());
            assert_eq!(s.iv(), c.iv());
            assert_eq!(s.salt(), c.salt());
            assert_eq!(c.mode(), mode);

            assert_eq!(server.mode(), EncryptionMode::Symmetric);
            assert_eq!(client.mode(), EncryptionMode::Symmetric);

            assert_eq!(
                server.crypto().remote_fingerprint().unwrap(),
                client.crypto().local_fingerprint().unwrap()
            );

            client.send(b"after handshake").await.unwrap();
            assert_eq!(server.recv().await.unwrap(), b"after handshake");
        }
    }

    #[tokio::test]
    async fn test_dh_handshake_converges() {
        let (server, client) = transports(CipherMode::Aes128Cbc);
        let generated = server.crypto().symmetric().unwrap().clone();
        let (mut server, mut client) = run_both(server, client, KeyExchange::DiffieHellman).await;

        let s = server.crypto().symmetric().unwrap();
        let c = client.crypto().symmetric().unwrap();
        assert_eq!(s, c);
        // DH output replaced the pre-generated context
        assert_ne!(s, &generated);
        assert_eq!(s.mode(), CipherMode::Aes256Cbc);

        server.send(b"forward secret").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"forward secret");
    }

    #[tokio::test]
    async fn test_server_without_session_key() {
        let (a, mut peer) = duplex(4096);
        let mut server = Transport::from_stream(a, addr(), CryptoEngine::with_key_pair(test_key_pair(0)));

        let client_engine = CryptoEngine::with_key_pair(test_key_pair(1));
        let client_pem = client_engine.local_public_key_pem().unwrap();
        tokio::spawn(async move {
            let _server_key = frame::read_frame(&mut peer).await.unwrap();
            frame::write_frame(&mut peer, client_pem.as_bytes()).await.unwrap();
            // Hold the stream open until the server gives up
            let _ = frame::read_frame(&mut peer).await;
        });

        let err = server_handshake(&mut server, KeyExchange::Rsa).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Crypto(CryptoError::SymmetricKeyNotSet)));
        assert!(!server.crypto().has_remote_key());
        assert_eq!(server.mode(), EncryptionMode::None);
    }

    #[tokio::test]
    async fn test_peer_vanishes_mid_handshake() {
        let (mut server, client) = transports(CipherMode::Aes256Cbc);
        drop(client);

        let err = server_handshake(&mut server, KeyExchange::Rsa).await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_garbage_public_key() {
        let (a, mut peer) = duplex(4096);
        let mut client = Transport::from_stream(a, addr(), CryptoEngine::with_key_pair(test_key_pair(1)));

        frame::write_frame(&mut peer, b"definitely not PEM").await.unwrap();
        let err = client_handshake(&mut client, KeyExchange::Rsa).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Crypto(CryptoError::InvalidPublicKey(_))));
        assert!(!err.is_disconnect());
        assert!(client.is_connected());
        drop(peer);
    }

    #[tokio::test]
    async fn test_closed_before_key_material() {
        let (a, mut peer) = duplex(4096);
        let mut client = Transport::from_stream(a, addr(), CryptoEngine::with_key_pair(test_key_pair(1)));
        let server_engine = CryptoEngine::with_key_pair(test_key_pair(0));
        let server_pem = server_engine.local_public_key_pem().unwrap();

        frame::write_frame(&mut peer, server_pem.as_bytes()).await.unwrap();
        let closer = tokio::spawn(async move {
            let _client_key = frame::read_frame(&mut peer).await.unwrap();
            drop(peer);
        });

        let err = client_handshake(&mut client, KeyExchange::Rsa).await.unwrap_err();
        closer.await.unwrap();
        assert!(matches!(err, ProtocolError::Network(NetworkError::ClosedConnection)));
        assert!(client.crypto().symmetric().is_none());
        assert!(!client.crypto().has_remote_key());
    }
}
