//! # Error Types
//!
//! Two error kinds carry the weight of the protocol: [`CryptoError`] for
//! anything that goes wrong inside the crypto engine and [`NetworkError`] for
//! anything that goes wrong on the socket. [`ProtocolError`] wraps both for
//! the handshake and relay layers.

use std::net::SocketAddr;

use thiserror::Error;

/// Failures inside key generation, encryption, decryption or key parsing
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key pair generation was rejected by the RSA primitive
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Textual cipher mode could not be parsed
    #[error("Invalid cipher mode: {0}")]
    InvalidCipherMode(String),

    /// Local key pair used before it was generated or loaded
    #[error("Local keypair not set")]
    LocalKeyNotSet,

    /// Remote public key used before it was received
    #[error("Remote public key not set")]
    RemoteKeyNotSet,

    /// Remote public key may only be stored once per engine
    #[error("Remote public key already set")]
    RemoteKeyAlreadySet,

    /// Symmetric context used before it was generated or received
    #[error("Symmetric key not set")]
    SymmetricKeyNotSet,

    /// Diffie-Hellman secret requested before the DH key pair exists
    #[error("Diffie-Hellman key pair not generated")]
    DhKeyNotSet,

    /// Peer sent a DH public value outside the group
    #[error("Invalid Diffie-Hellman public value")]
    InvalidDhPublicValue,

    /// Serialized public key could not be parsed
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Serialized private key could not be parsed or decrypted
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Received symmetric key has a length no cipher mode accepts
    #[error("Invalid symmetric key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Encryption was rejected by the underlying primitive
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed (bad padding, wrong key, truncated input)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Key serialization failed
    #[error("Key encoding failed: {0}")]
    Encoding(String),
}

/// Result type alias for crypto engine operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Failures inside connect, send or receive
#[derive(Error, Debug)]
pub enum NetworkError {
    /// A write made no progress: the peer went away mid-send
    #[error("Connection closed unexpectedly")]
    UnexpectedClose,

    /// A read returned end-of-stream before the frame was complete
    #[error("Connection closed by remote peer")]
    ClosedConnection,

    /// Operation attempted on a transport that is not connected
    #[error("Transport is not connected")]
    NotConnected,

    /// Length prefix announced more than we are willing to buffer
    #[error("Frame exceeds maximum size: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Any other socket failure
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
}

impl NetworkError {
    /// True when the error means the remote end is gone
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, NetworkError::FrameTooLarge { .. })
    }
}

/// Result type alias for transport operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Registry mutations that cannot be applied
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Nickname is held by another connection
    #[error("Nickname {nickname} is already registered to {holder}")]
    NicknameTaken {
        nickname: String,
        holder: SocketAddr,
    },

    /// Connection was terminated and can no longer be tracked or reached
    #[error("Connection {addr} is closed")]
    ConnectionClosed { addr: SocketAddr },

    /// Peer is not draining its outbound queue
    #[error("Outbound queue for {addr} is full")]
    MailboxFull { addr: SocketAddr },
}

/// Failures while persisting or loading key material
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Key store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("No home directory available for the key store")]
    NoHomeDirectory,
}

/// Failures while reading or writing configuration files
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Umbrella error for the handshake and relay layers
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Relay message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Peer sent a well-formed message that makes no sense right now
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Server refused a request
    #[error("Rejected by server: {0}")]
    Rejected(String),
}

impl ProtocolError {
    /// True when the failure came from the peer disappearing
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Network(e) if e.is_disconnect())
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
