//! # Connection Registry
//!
//! Server-side bookkeeping of every accepted connection, indexed two ways:
//! by remote address (always) and by nickname (once registered).
//!
//! ## Connection lifecycle
//!
//! ```text
//! Connecting ──► Handshaking ──► Established
//!      │               │              │
//!      └───────────────┴──────┬───────┘
//!              I/O failure    │    terminate()
//!                   ▼         │         ▼
//!                Zombie ──────┴────► Closed
//! ```
//!
//! A zombie keeps its address entry so an operator can see it, but it can no
//! longer be reached by name. Only `terminate` removes entries.
//!
//! Both maps live behind one mutex; every mutation takes it exactly once and
//! never holds it across an `.await`. A connection's state only becomes
//! `Closed` under that mutex, so a terminated connection can never be
//! registered again.
//!
//! Each connection's outbound queue holds at most [`OUTBOUND_CAPACITY`]
//! messages. Deliveries to a peer that stops reading fail fast with
//! [`RegistryError::MailboxFull`] instead of piling up in memory.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::message::RelayMessage;

/// Messages queued for one peer before deliveries are refused
pub const OUTBOUND_CAPACITY: usize = 256;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    /// Peer vanished; waiting for an operator to clean up
    Zombie,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Handshaking => write!(f, "HANDSHAKING"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Zombie => write!(f, "ZOMBIE"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Receiving ends owned by the task serving a connection
pub struct ConnectionSignals {
    /// Messages other sessions want delivered to this peer
    pub outbound: mpsc::Receiver<RelayMessage>,
    /// Flips to `true` when the connection is terminated
    pub kill: watch::Receiver<bool>,
}

/// Shared handle to one peer connection
pub struct Connection {
    addr: SocketAddr,
    state: Mutex<ConnectionState>,
    nickname: Mutex<Option<String>>,
    outbound: mpsc::Sender<RelayMessage>,
    kill: watch::Sender<bool>,
}

impl Connection {
    /// New connection in the `Connecting` state
    pub fn new(addr: SocketAddr) -> (Arc<Self>, ConnectionSignals) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (kill_tx, kill_rx) = watch::channel(false);

        let connection = Arc::new(Self {
            addr,
            state: Mutex::new(ConnectionState::Connecting),
            nickname: Mutex::new(None),
            outbound: outbound_tx,
            kill: kill_tx,
        });

        (
            connection,
            ConnectionSignals {
                outbound: outbound_rx,
                kill: kill_rx,
            },
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Record a handshake or transport driven transition
    pub fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != state {
            debug!("{}: {} -> {}", self.addr, *current, state);
            *current = state;
        }
    }

    pub fn nickname(&self) -> Option<String> {
        lock(&self.nickname).clone()
    }

    /// Queue a message for the peer without waiting
    pub fn deliver(&self, message: RelayMessage) -> Result<(), RegistryError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => RegistryError::MailboxFull { addr: self.addr },
            TrySendError::Closed(_) => RegistryError::ConnectionClosed { addr: self.addr },
        })
    }

    /// Ask the serving task to disconnect the transport
    fn kill(&self) {
        self.kill.send_replace(true);
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.nickname() {
            Some(nick) => write!(f, "{} ({})", nick, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_nickname: HashMap<String, Arc<Connection>>,
    by_addr: HashMap<SocketAddr, Arc<Connection>>,
}

impl RegistryInner {
    fn unlink_nickname(&mut self, connection: &Arc<Connection>) {
        if let Some(nick) = lock(&connection.nickname).take() {
            let owned = self
                .by_nickname
                .get(&nick)
                .is_some_and(|held| Arc::ptr_eq(held, connection));
            if owned {
                self.by_nickname.remove(&nick);
            }
        }
    }
}

/// Cloneable handle to the shared registry
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        lock(&self.inner)
    }

    /// Track `connection` by address and, when given, by nickname
    ///
    /// Calling it again for the same connection with a new nickname renames
    /// it. Nothing changes if the nickname belongs to someone else or the
    /// connection was already terminated.
    pub fn register(
        &self,
        connection: &Arc<Connection>,
        nickname: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner();

        if connection.state() == ConnectionState::Closed {
            return Err(RegistryError::ConnectionClosed {
                addr: connection.addr(),
            });
        }

        if let Some(nick) = nickname {
            if let Some(holder) = inner.by_nickname.get(nick) {
                if !Arc::ptr_eq(holder, connection) {
                    return Err(RegistryError::NicknameTaken {
                        nickname: nick.to_string(),
                        holder: holder.addr(),
                    });
                }
                return Ok(());
            }

            inner.unlink_nickname(connection);
            inner
                .by_nickname
                .insert(nick.to_string(), Arc::clone(connection));
            *lock(&connection.nickname) = Some(nick.to_string());
            info!("{} registered as {}", connection.addr(), nick);
        }

        inner
            .by_addr
            .insert(connection.addr(), Arc::clone(connection));
        Ok(())
    }

    pub fn lookup_by_nickname(&self, nickname: &str) -> Option<Arc<Connection>> {
        self.inner().by_nickname.get(nickname).cloned()
    }

    pub fn lookup_by_address(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.inner().by_addr.get(addr).cloned()
    }

    /// The peer closed unexpectedly: unreachable by name, still listed by
    /// address. Returns false if the connection was no longer registered.
    pub fn mark_zombie(&self, connection: &Arc<Connection>) -> bool {
        let mut inner = self.inner();

        let registered = inner
            .by_addr
            .get(&connection.addr())
            .is_some_and(|held| Arc::ptr_eq(held, connection));
        if !registered {
            return false;
        }

        inner.unlink_nickname(connection);
        connection.set_state(ConnectionState::Zombie);
        info!("{} is now a zombie", connection.addr());
        true
    }

    /// Force the connection closed and forget it entirely
    pub fn terminate(&self, connection: &Arc<Connection>) {
        {
            let mut inner = self.inner();
            inner.unlink_nickname(connection);
            let owned = inner
                .by_addr
                .get(&connection.addr())
                .is_some_and(|held| Arc::ptr_eq(held, connection));
            if owned {
                inner.by_addr.remove(&connection.addr());
            }
            connection.set_state(ConnectionState::Closed);
        }

        connection.kill();
        info!("{} terminated", connection.addr());
    }

    /// Registered nicknames with their addresses, sorted by nickname
    pub fn nicknames(&self) -> Vec<(String, SocketAddr)> {
        let mut list: Vec<_> = self
            .inner()
            .by_nickname
            .iter()
            .map(|(nick, conn)| (nick.clone(), conn.addr()))
            .collect();
        list.sort();
        list
    }

    /// Addresses of zombie entries, sorted
    pub fn zombies(&self) -> Vec<SocketAddr> {
        let mut list: Vec<_> = self
            .inner()
            .by_addr
            .values()
            .filter(|conn| conn.state() == ConnectionState::Zombie)
            .map(|conn| conn.addr())
            .collect();
        list.sort();
        list
    }

    /// Snapshot of every tracked connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner().by_addr.values().cloned().collect()
    }

    /// Number of tracked connections, zombies included
    pub fn len(&self) -> usize {
        self.inner().by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock ignoring poisoning; the guarded data stays consistent because no
/// critical section can panic midway.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_register_by_address_and_nickname() {
        let registry = ConnectionRegistry::new();
        let (conn, _signals) = Connection::new(addr(1));

        registry.register(&conn, None).unwrap();
        assert!(registry.lookup_by_address(&addr(1)).is_some());
        assert!(registry.nicknames().is_empty());

        registry.register(&conn, Some("alice")).unwrap();
        let found = registry.lookup_by_nickname("alice").unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert_eq!(conn.nickname().as_deref(), Some("alice"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_miss_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup_by_nickname("nobody").is_none());
        assert!(registry.lookup_by_address(&addr(9)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zombie_then_terminate() {
        let registry = ConnectionRegistry::new();
        let (c1, signals) = Connection::new(addr(1));
        registry.register(&c1, Some("alice")).unwrap();
        c1.set_state(ConnectionState::Established);

        assert!(registry.mark_zombie(&c1));
        assert_eq!(c1.state(), ConnectionState::Zombie);
        assert!(registry.lookup_by_nickname("alice").is_none());
        assert!(registry.lookup_by_address(&addr(1)).is_some());
        assert_eq!(registry.zombies(), vec![addr(1)]);

        registry.terminate(&c1);
        assert_eq!(c1.state(), ConnectionState::Closed);
        assert!(registry.lookup_by_address(&addr(1)).is_none());
        assert!(registry.zombies().is_empty());
        assert!(*signals.kill.borrow());
    }

    #[test]
    fn test_nickname_freed_by_zombie() {
        let registry = ConnectionRegistry::new();
        let (c1, _s1) = Connection::new(addr(1));
        let (c2, _s2) = Connection::new(addr(2));
        registry.register(&c1, Some("alice")).unwrap();
        registry.mark_zombie(&c1);

        registry.register(&c2, Some("alice")).unwrap();
        assert!(Arc::ptr_eq(&registry.lookup_by_nickname("alice").unwrap(), &c2));

        // Cleaning up the zombie must not evict the new holder
        registry.terminate(&c1);
        assert!(Arc::ptr_eq(&registry.lookup_by_nickname("alice").unwrap(), &c2));
    }

    #[test]
    fn test_nickname_collision_leaves_state_untouched() {
        let registry = ConnectionRegistry::new();
        let (c1, _s1) = Connection::new(addr(1));
        let (c2, _s2) = Connection::new(addr(2));
        registry.register(&c1, Some("alice")).unwrap();

        let err = registry.register(&c2, Some("alice")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::NicknameTaken {
                nickname: "alice".to_string(),
                holder: addr(1),
            }
        );
        assert!(Arc::ptr_eq(&registry.lookup_by_nickname("alice").unwrap(), &c1));
        assert!(registry.lookup_by_address(&addr(2)).is_none());
        assert_eq!(c2.nickname(), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rename() {
        let registry = ConnectionRegistry::new();
        let (c1, _s1) = Connection::new(addr(1));
        registry.register(&c1, Some("alice")).unwrap();
        registry.register(&c1, Some("alice")).unwrap();
        registry.register(&c1, Some("alicia")).unwrap();

        assert!(registry.lookup_by_nickname("alice").is_none());
        assert!(registry.lookup_by_nickname("alicia").is_some());
        assert_eq!(registry.nicknames(), vec![("alicia".to_string(), addr(1))]);
    }

    #[test]
    fn test_mark_zombie_after_terminate_is_noop() {
        let registry = ConnectionRegistry::new();
        let (c1, _s1) = Connection::new(addr(1));
        registry.register(&c1, None).unwrap();
        registry.terminate(&c1);

        assert!(!registry.mark_zombie(&c1));
        assert_eq!(c1.state(), ConnectionState::Closed);
        assert!(registry.zombies().is_empty());
    }

    #[test]
    fn test_register_after_terminate_is_refused() {
        let registry = ConnectionRegistry::new();
        let (c1, _s1) = Connection::new(addr(1));
        registry.register(&c1, None).unwrap();
        c1.set_state(ConnectionState::Established);

        // An operator kick lands before the session handles its Register
        registry.terminate(&c1);
        let err = registry.register(&c1, Some("alice")).unwrap_err();
        assert_eq!(err, RegistryError::ConnectionClosed { addr: addr(1) });

        assert!(registry.lookup_by_nickname("alice").is_none());
        assert!(registry.lookup_by_address(&addr(1)).is_none());
        assert_eq!(c1.nickname(), None);
        assert!(registry.is_empty());

        // The nickname is still available to everyone else
        let (c2, _s2) = Connection::new(addr(2));
        registry.register(&c2, Some("alice")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deliver_reaches_session() {
        let (c1, mut signals) = Connection::new(addr(1));
        c1.deliver(RelayMessage::End).unwrap();
        assert_eq!(signals.outbound.try_recv().unwrap(), RelayMessage::End);

        drop(signals);
        assert_eq!(
            c1.deliver(RelayMessage::End),
            Err(RegistryError::ConnectionClosed { addr: addr(1) })
        );
    }

    #[test]
    fn test_full_mailbox_refuses_delivery() {
        let (c1, mut signals) = Connection::new(addr(1));
        let note = || RelayMessage::Deliver {
            from: "bob".to_string(),
            payload: vec![0; 64],
        };

        for _ in 0..OUTBOUND_CAPACITY {
            c1.deliver(note()).unwrap();
        }
        assert_eq!(
            c1.deliver(note()),
            Err(RegistryError::MailboxFull { addr: addr(1) })
        );

        // Draining one message makes room for exactly one more
        signals.outbound.try_recv().unwrap();
        c1.deliver(note()).unwrap();
        assert!(c1.deliver(note()).is_err());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (conn, _signals) = Connection::new(addr(i));
                    registry.register(&conn, Some("shared")).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
