//! # Relay Messages
//!
//! Once the handshake is done every frame carries one bincode-encoded
//! [`RelayMessage`].

use serde::{Deserialize, Serialize};

use crate::error::ProtocolResult;

/// Messages exchanged between chat clients and the relay server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Client asks to be reachable under `nickname`
    Register { nickname: String },
    /// Server confirms a registration
    Registered { nickname: String },
    /// Client asks the server to forward `payload` to `to`
    Relay { to: String, payload: Vec<u8> },
    /// Server hands over a payload relayed from `from`
    Deliver { from: String, payload: Vec<u8> },
    /// Server refuses a request
    Error { reason: String },
    /// Client is leaving
    End,
}

impl RelayMessage {
    pub fn error(reason: impl Into<String>) -> Self {
        RelayMessage::Error {
            reason: reason.into(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| e.into())
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        bincode::deserialize(data).map_err(|e| e.into())
    }
}
