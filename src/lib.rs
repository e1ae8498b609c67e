//! # cipherlink
//!
//! Secure-channel core of a two-party encrypted messaging relay:
//! - RSA-OAEP bootstrapped AES-CBC sessions, or Diffie-Hellman derived ones
//! - Length-prefixed framing with a per-message encryption mode
//! - Server-side connection registry with zombie tracking
//! - Operator console for listing, kicking and killing connections
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                              Server
//!   |                                    |
//!   |<------ server public key ----------|
//!   |------- client public key --------->|
//!   |                                    |
//!   |  [RSA: AES key/IV/salt under OAEP] |
//!   |  [DH:  public values, both derive] |
//!   |                                    |
//!   |------- Register { nickname } ----->|
//!   |<------ Registered -----------------|
//!   |------- Relay { to, payload } ----->|  ──► Deliver to `to`
//!   |                                    |
//! ```
//!
//! ## Security Properties
//!
//! - Confidentiality per session (fresh AES context per connection)
//! - Peer identity by fingerprint comparison only
//! - Forward secrecy on the Diffie-Hellman path

pub mod cipher;
pub mod client;
pub mod config;
pub mod console;
pub mod crypto;
pub mod dh;
pub mod error;
pub mod fingerprint;
pub mod frame;
pub mod handshake;
pub mod keystore;
pub mod message;
pub mod registry;
pub mod server;
pub mod transport;

pub use cipher::{CipherMode, SymmetricContext};
pub use client::{ChatClient, Inbox, Outbox};
pub use config::{ClientConfig, ServerConfig};
pub use console::Console;
pub use crypto::{CryptoEngine, HashAlgorithm};
pub use error::*;
pub use fingerprint::fingerprint;
pub use handshake::{client_handshake, perform_handshake, server_handshake, KeyExchange, Role};
pub use keystore::KeyStore;
pub use message::RelayMessage;
pub use registry::{Connection, ConnectionRegistry, ConnectionState, OUTBOUND_CAPACITY};
pub use server::RelayServer;
pub use transport::{EncryptionMode, Transport, TransportListener};
