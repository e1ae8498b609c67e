//! # Relay Server
//!
//! Accepts connections, runs the server side of the handshake on each one and
//! then relays [`RelayMessage`]s between registered nicknames.
//!
//! Each accepted connection gets its own task. Once established, that task
//! splits the transport: it keeps reading client requests itself while a
//! writer task drains the connection's outbound queue. The registry outcome
//! follows how the session ended:
//!
//! | Session end                         | Registry           |
//! |-------------------------------------|--------------------|
//! | client sent `End`                   | `terminate`        |
//! | socket failure (handshake or later) | `mark_zombie`      |
//! | crypto or protocol failure          | `terminate`        |
//! | operator `kick` / `kill`            | already terminated |

use std::net::SocketAddr;
use std::sync::Arc;

use rsa::RsaPrivateKey;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::cipher::CipherMode;
use crate::config::ServerConfig;
use crate::crypto::CryptoEngine;
use crate::error::{NetworkResult, ProtocolError, ProtocolResult, RegistryError};
use crate::handshake::{server_handshake, KeyExchange};
use crate::message::RelayMessage;
use crate::registry::{Connection, ConnectionRegistry, ConnectionSignals, ConnectionState};
use crate::transport::{Transport, TransportListener, TransportReader, TransportWriter};

/// Listening relay server
pub struct RelayServer {
    listener: TransportListener,
    identity: Arc<RsaPrivateKey>,
    cipher: CipherMode,
    key_exchange: KeyExchange,
    registry: ConnectionRegistry,
}

impl RelayServer {
    /// Bind the listening socket; `identity` is the server's RSA key pair
    pub async fn bind(config: &ServerConfig, identity: RsaPrivateKey) -> NetworkResult<Self> {
        let listener = TransportListener::bind(config.listen).await?;
        info!(
            "Relay listening on {} ({}, {})",
            listener.local_addr(),
            config.key_exchange,
            config.cipher
        );

        Ok(Self {
            listener,
            identity: Arc::new(identity),
            cipher: config.cipher,
            key_exchange: config.key_exchange,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle to the live registry, for the console and for tests
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Engine for one new connection: shared identity, fresh session key
    fn session_engine(&self) -> CryptoEngine {
        let mut engine = CryptoEngine::with_key_pair(RsaPrivateKey::clone(&self.identity));
        if self.key_exchange == KeyExchange::Rsa {
            engine.generate_symmetric_key(self.cipher);
        }
        engine
    }

    /// Accept connections until `shutdown` flips to true
    ///
    /// Every remaining connection is terminated on the way out.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> NetworkResult<()> {
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = self.listener.accept(self.session_engine()) => match accepted {
                    Ok(transport) => {
                        info!("Connection from {}", transport.addr());
                        let registry = self.registry.clone();
                        let key_exchange = self.key_exchange;
                        tokio::spawn(async move {
                            serve_connection(transport, registry, key_exchange).await;
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Relay shutting down");
        for connection in self.registry.connections() {
            self.registry.terminate(&connection);
        }
        Ok(())
    }
}

/// Drive one connection from accept to its final registry state
async fn serve_connection(
    transport: Transport<TcpStream>,
    registry: ConnectionRegistry,
    key_exchange: KeyExchange,
) {
    let addr = transport.addr();
    let (connection, signals) = Connection::new(addr);
    if let Err(e) = registry.register(&connection, None) {
        error!("Could not track {}: {}", addr, e);
        return;
    }

    let result = run_session(transport, &connection, &registry, signals, key_exchange).await;

    if connection.state() == ConnectionState::Closed {
        debug!("Session for {} ended after termination", addr);
        return;
    }
    match result {
        Ok(()) => registry.terminate(&connection),
        Err(e) if e.is_disconnect() => {
            info!("{} went away: {}", connection, e);
            registry.mark_zombie(&connection);
        }
        Err(e) => {
            warn!("Session with {} failed: {}", connection, e);
            registry.terminate(&connection);
        }
    }
}

async fn run_session(
    mut transport: Transport<TcpStream>,
    connection: &Arc<Connection>,
    registry: &ConnectionRegistry,
    signals: ConnectionSignals,
    key_exchange: KeyExchange,
) -> ProtocolResult<()> {
    let ConnectionSignals { outbound, mut kill } = signals;

    connection.set_state(ConnectionState::Handshaking);
    let handshake = tokio::select! {
        result = server_handshake(&mut transport, key_exchange) => Some(result),
        _ = kill.changed() => None,
    };
    let Some(handshake) = handshake else {
        transport.disconnect().await;
        return Ok(());
    };
    handshake?;

    if *kill.borrow() {
        transport.disconnect().await;
        return Ok(());
    }
    connection.set_state(ConnectionState::Established);
    info!(
        "Session with {} established, client fingerprint {}",
        connection.addr(),
        transport.crypto().remote_fingerprint()?
    );

    let (reader, writer) = transport.into_split()?;
    let (stop_tx, stop_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_loop(writer, outbound, kill.clone(), stop_rx));

    let result = read_loop(reader, connection, registry, kill).await;

    let _ = stop_tx.send(());
    match writer_task.await {
        Ok(Err(e)) => debug!("Writer for {} stopped: {}", connection.addr(), e),
        Err(e) => error!("Writer for {} panicked: {}", connection.addr(), e),
        Ok(Ok(())) => {}
    }
    result
}

/// Handle client requests until `End`, a kill, or an error
async fn read_loop(
    mut reader: TransportReader<TcpStream>,
    connection: &Arc<Connection>,
    registry: &ConnectionRegistry,
    mut kill: watch::Receiver<bool>,
) -> ProtocolResult<()> {
    loop {
        let frame = tokio::select! {
            frame = reader.recv() => frame?,
            _ = kill.changed() => return Ok(()),
        };

        match RelayMessage::from_bytes(&frame)? {
            RelayMessage::Register { nickname } => {
                let response = match registry.register(connection, Some(&nickname)) {
                    Ok(()) => RelayMessage::Registered { nickname },
                    Err(e) => {
                        info!("Rejected registration from {}: {}", connection.addr(), e);
                        RelayMessage::error(e.to_string())
                    }
                };
                reply(connection, response);
            }
            RelayMessage::Relay { to, payload } => {
                if let Some(failure) = route_relay(registry, connection, &to, payload) {
                    reply(connection, failure);
                }
            }
            RelayMessage::End => {
                info!("{} said goodbye", connection);
                return Ok(());
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(format!(
                    "client sent {}",
                    message_name(&other)
                )));
            }
        }
    }
}

/// Hand `payload` to the holder of `to`; the error to send back if that fails
fn route_relay(
    registry: &ConnectionRegistry,
    sender: &Connection,
    to: &str,
    payload: Vec<u8>,
) -> Option<RelayMessage> {
    let Some(from) = sender.nickname() else {
        return Some(RelayMessage::error("Register a nick first"));
    };
    let Some(target) = registry.lookup_by_nickname(to) else {
        return Some(RelayMessage::error(format!("{} is not a registered nick", to)));
    };

    match target.deliver(RelayMessage::Deliver { from, payload }) {
        Ok(()) => None,
        Err(RegistryError::MailboxFull { .. }) => {
            warn!("Dropping message from {} for {}: queue full", sender, target);
            Some(RelayMessage::error(format!("{} is not keeping up, message dropped", to)))
        }
        Err(_) => Some(RelayMessage::error(format!("{} is not a registered nick", to))),
    }
}

/// Queue a response for the requesting client itself
fn reply(connection: &Connection, message: RelayMessage) {
    if let Err(e) = connection.deliver(message) {
        debug!("Reply to {} dropped: {}", connection, e);
    }
}

/// Forward queued messages to the client until told to stop
async fn write_loop(
    mut writer: TransportWriter<TcpStream>,
    mut outbound: mpsc::Receiver<RelayMessage>,
    mut kill: watch::Receiver<bool>,
    mut stop: oneshot::Receiver<()>,
) -> ProtocolResult<()> {
    let result = loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break Ok(()) };
                let sent = match message.to_bytes() {
                    Ok(bytes) => writer.send(&bytes).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    break Err(e);
                }
            }
            _ = kill.changed() => break Ok(()),
            _ = &mut stop => break Ok(()),
        }
    };

    writer.disconnect().await;
    result
}

fn message_name(message: &RelayMessage) -> &'static str {
    match message {
        RelayMessage::Register { .. } => "Register",
        RelayMessage::Registered { .. } => "Registered",
        RelayMessage::Relay { .. } => "Relay",
        RelayMessage::Deliver { .. } => "Deliver",
        RelayMessage::Error { .. } => "Error",
        RelayMessage::End => "End",
    }
}
