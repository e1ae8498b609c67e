//! # Transport Layer
//!
//! A connected stream plus a [`CryptoEngine`]. The current
//! [`EncryptionMode`] decides how `send`/`recv` transform payloads; the
//! framing in [`crate::frame`] never sees plaintext once a mode is active.
//!
//! Any I/O failure clears `is_connected`. `disconnect` never fails.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::crypto::CryptoEngine;
use crate::error::{NetworkError, NetworkResult, ProtocolResult};
use crate::frame;

/// How payloads are transformed on the way in and out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionMode {
    /// Plain bytes
    #[default]
    None,
    /// RSA-OAEP: remote key to send, local key to receive
    Asymmetric,
    /// AES with the session context
    Symmetric,
}

fn seal(crypto: &CryptoEngine, mode: EncryptionMode, message: &[u8]) -> ProtocolResult<Vec<u8>> {
    Ok(match mode {
        EncryptionMode::None => message.to_vec(),
        EncryptionMode::Asymmetric => crypto.asymmetric_encrypt(message)?,
        EncryptionMode::Symmetric => crypto.symmetric_encrypt(message)?,
    })
}

fn open(crypto: &CryptoEngine, mode: EncryptionMode, payload: Vec<u8>) -> ProtocolResult<Vec<u8>> {
    Ok(match mode {
        EncryptionMode::None => payload,
        EncryptionMode::Asymmetric => crypto.asymmetric_decrypt(&payload)?,
        EncryptionMode::Symmetric => crypto.symmetric_decrypt(&payload)?,
    })
}

/// Framed, optionally encrypted connection to one peer
pub struct Transport<S = TcpStream> {
    addr: SocketAddr,
    stream: Option<S>,
    crypto: CryptoEngine,
    mode: EncryptionMode,
    connected: bool,
}

impl Transport<TcpStream> {
    /// Unconnected transport towards `addr`
    pub fn new(addr: SocketAddr, crypto: CryptoEngine) -> Self {
        Self {
            addr,
            stream: None,
            crypto,
            mode: EncryptionMode::None,
            connected: false,
        }
    }

    /// Open the TCP connection
    pub async fn connect(&mut self) -> NetworkResult<()> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.connected = true;
        debug!("Connected to {}", self.addr);
        Ok(())
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream that is already connected
    pub fn from_stream(stream: S, addr: SocketAddr, crypto: CryptoEngine) -> Self {
        Self {
            addr,
            stream: Some(stream),
            crypto,
            mode: EncryptionMode::None,
            connected: true,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Switch payload transformation for subsequent sends and receives
    pub fn set_mode(&mut self, mode: EncryptionMode) {
        self.mode = mode;
    }

    pub fn crypto(&self) -> &CryptoEngine {
        &self.crypto
    }

    pub fn crypto_mut(&mut self) -> &mut CryptoEngine {
        &mut self.crypto
    }

    /// Transform `message` per the current mode and send it as one frame
    pub async fn send(&mut self, message: &[u8]) -> ProtocolResult<()> {
        let payload = seal(&self.crypto, self.mode, message)?;
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;

        if let Err(e) = frame::write_frame(stream, &payload).await {
            self.connected = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Receive one frame and undo the current mode's transformation
    pub async fn recv(&mut self) -> ProtocolResult<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;

        let payload = match frame::read_frame(stream).await {
            Ok(payload) => payload,
            Err(e) => {
                self.connected = false;
                return Err(e.into());
            }
        };
        open(&self.crypto, self.mode, payload)
    }

    /// Shut the stream down, ignoring any failure
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.addr, e);
            }
        }
        self.connected = false;
    }

    /// Split into independently owned halves
    ///
    /// The engine becomes shared and read-only, so this belongs after the
    /// handshake.
    pub fn into_split(self) -> NetworkResult<(TransportReader<S>, TransportWriter<S>)> {
        let stream = self.stream.ok_or(NetworkError::NotConnected)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let crypto = Arc::new(self.crypto);
        let connected = Arc::new(AtomicBool::new(self.connected));

        Ok((
            TransportReader {
                addr: self.addr,
                stream: read_half,
                crypto: Arc::clone(&crypto),
                mode: self.mode,
                connected: Arc::clone(&connected),
            },
            TransportWriter {
                addr: self.addr,
                stream: Some(write_half),
                crypto,
                mode: self.mode,
                connected,
            },
        ))
    }
}

impl<S> fmt::Display for Transport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Receiving half of a split transport
pub struct TransportReader<S> {
    addr: SocketAddr,
    stream: ReadHalf<S>,
    crypto: Arc<CryptoEngine>,
    mode: EncryptionMode,
    connected: Arc<AtomicBool>,
}

impl<S> TransportReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> ProtocolResult<Vec<u8>> {
        let payload = match frame::read_frame(&mut self.stream).await {
            Ok(payload) => payload,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        open(&self.crypto, self.mode, payload)
    }
}

/// Sending half of a split transport
pub struct TransportWriter<S> {
    addr: SocketAddr,
    stream: Option<WriteHalf<S>>,
    crypto: Arc<CryptoEngine>,
    mode: EncryptionMode,
    connected: Arc<AtomicBool>,
}

impl<S> TransportWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(&mut self, message: &[u8]) -> ProtocolResult<()> {
        let payload = seal(&self.crypto, self.mode, message)?;
        let stream = self.stream.as_mut().ok_or(NetworkError::NotConnected)?;

        if let Err(e) = frame::write_frame(stream, &payload).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    /// Shut the write side down; the reader sees end-of-stream from the peer
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.addr, e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// TCP listener handing out plaintext transports
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    pub async fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection, attaching `crypto` to it
    pub async fn accept(&self, crypto: CryptoEngine) -> NetworkResult<Transport> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Transport::from_stream(stream, addr, crypto))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherMode;
    use crate::crypto::test_key_pair;
    use crate::error::ProtocolError;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// Sender can seal for the receiver in every mode
    fn engine_pair() -> (CryptoEngine, CryptoEngine) {
        let mut sender = CryptoEngine::with_key_pair(test_key_pair(0));
        let mut receiver = CryptoEngine::with_key_pair(test_key_pair(1));
        sender
            .set_remote_public_key_pem(receiver.local_public_key_pem().unwrap().as_bytes())
            .unwrap();
        sender.generate_symmetric_key(CipherMode::Aes256Cbc);
        let ctx = sender.symmetric().unwrap().clone();
        receiver.install_symmetric(ctx);
        (sender, receiver)
    }

    fn duplex_pair(buffer: usize) -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let (a, b) = duplex(buffer);
        let (sender, receiver) = engine_pair();
        (
            Transport::from_stream(a, addr(), sender),
            Transport::from_stream(b, addr(), receiver),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_over_tcp_in_every_mode() {
        let listener = TransportListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = listener.local_addr();
        let (sender_engine, receiver_engine) = engine_pair();

        let server = tokio::spawn(async move {
            let mut transport = listener.accept(receiver_engine).await.unwrap();
            let mut received = Vec::new();
            for mode in [EncryptionMode::None, EncryptionMode::Asymmetric, EncryptionMode::Symmetric] {
                transport.set_mode(mode);
                received.push(transport.recv().await.unwrap());
                received.push(transport.recv().await.unwrap());
            }
            received
        });

        let mut client = Transport::new(server_addr, sender_engine);
        assert!(!client.is_connected());
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let payloads: [&[u8]; 2] = [b"", b"a payload under the OAEP limit"];
        for mode in [EncryptionMode::None, EncryptionMode::Asymmetric, EncryptionMode::Symmetric] {
            client.set_mode(mode);
            for payload in payloads {
                client.send(payload).await.unwrap();
            }
        }

        let received = server.await.unwrap();
        for (i, got) in received.iter().enumerate() {
            assert_eq!(got.as_slice(), payloads[i % 2]);
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let mut transport = Transport::new(port, CryptoEngine::new());
        assert!(matches!(transport.connect().await, Err(NetworkError::Socket(_))));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_length_prefix_counts_wire_bytes() {
        let (a, mut raw) = duplex(4096);
        let (sender, _) = engine_pair();
        let mut transport = Transport::from_stream(a, addr(), sender);
        transport.set_mode(EncryptionMode::Symmetric);

        transport.send(b"hello").await.unwrap();
        let wire = frame::read_frame(&mut raw).await.unwrap();
        // 5 bytes of plaintext pad to one AES block
        assert_eq!(wire.len(), 16);
        assert_ne!(&wire[..5], b"hello");
    }

    #[tokio::test]
    async fn test_one_byte_io_symmetric() {
        let (mut sender, mut receiver) = duplex_pair(1);
        sender.set_mode(EncryptionMode::Symmetric);
        receiver.set_mode(EncryptionMode::Symmetric);

        let payload: Vec<u8> = (0..10 * 1024).map(|i| (i * 7 % 256) as u8).collect();
        let expected = payload.clone();
        let send = tokio::spawn(async move {
            sender.send(&payload).await.unwrap();
            sender
        });

        assert_eq!(receiver.recv().await.unwrap(), expected);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_closes_mid_payload() {
        let (mut raw, b) = duplex(64);
        let (_, receiver) = engine_pair();
        let mut transport = Transport::from_stream(b, addr(), receiver);

        raw.write_all(&[0, 0, 0, 50]).await.unwrap();
        raw.write_all(b"only part").await.unwrap();
        drop(raw);

        let err = transport.recv().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Network(NetworkError::ClosedConnection)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_peer_closes_mid_prefix() {
        let (mut raw, b) = duplex(64);
        let mut transport = Transport::from_stream(b, addr(), CryptoEngine::new());

        raw.write_all(&[0, 0, 1]).await.unwrap();
        drop(raw);

        assert!(transport.recv().await.unwrap_err().is_disconnect());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_to_closed_peer() {
        let (a, b) = duplex(64);
        let mut transport = Transport::from_stream(a, addr(), CryptoEngine::new());
        drop(b);

        let err = transport.send(b"anyone?").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Network(NetworkError::UnexpectedClose)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_decrypt_failure_is_crypto_error() {
        let (mut raw, b) = duplex(64);
        let (_, receiver) = engine_pair();
        let mut transport = Transport::from_stream(b, addr(), receiver);
        transport.set_mode(EncryptionMode::Symmetric);

        frame::write_frame(&mut raw, b"not ciphertext").await.unwrap();
        assert!(matches!(transport.recv().await, Err(ProtocolError::Crypto(_))));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (a, _b) = duplex(64);
        let mut transport = Transport::from_stream(a, addr(), CryptoEngine::new());

        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(b"x").await,
            Err(ProtocolError::Network(NetworkError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (mut sender, mut receiver) = duplex_pair(256);
        sender.set_mode(EncryptionMode::Symmetric);
        receiver.set_mode(EncryptionMode::Symmetric);

        let (mut reader, mut writer) = receiver.into_split().unwrap();
        sender.send(b"ping").await.unwrap();
        assert_eq!(reader.recv().await.unwrap(), b"ping");

        // Writing back needs the sender's view of the context; both share it
        writer.send(b"pong").await.unwrap();
        assert_eq!(sender.recv().await.unwrap(), b"pong");

        writer.disconnect().await;
        assert!(!reader.is_connected());
        assert!(sender.recv().await.unwrap_err().is_disconnect());
    }
}
