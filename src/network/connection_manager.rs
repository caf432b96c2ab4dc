//! Connection manager: the authoritative roster of authenticated peers.
//! Uses DashMap for lock-free concurrent access to connection states.
//!
//! Every Connecting -> Open and Open -> Closed transition produces exactly one
//! `PeerEvent` for each registered listener. Events are emitted while the
//! peer's map entry is held, so transitions for one peer are serialized and
//! listeners see them in order, without a lock across the whole roster.

use crate::identity::PeerId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Already connected to {0}")]
    AlreadyConnected(String),
    #[error("Connection limit reached: {0}")]
    LimitReached(String),
    #[error("Unknown connection attempt {0}")]
    UnknownAttempt(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_peer: PeerId,
    pub local_peer: PeerId,
    pub remote_addr: String,
    pub direction: ConnectionDirection,
    pub state: ConnectionState,
    pub opened_at: Instant,
}

#[derive(Clone, Debug)]
struct PendingConnection {
    remote_addr: String,
    direction: ConnectionDirection,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected {
        peer: PeerId,
        addr: String,
        direction: ConnectionDirection,
    },
    Disconnected {
        peer: PeerId,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    pub max_connections: usize,
    pub max_inbound: usize,
    pub max_outbound: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 125,
            max_inbound: 100,
            max_outbound: 25,
        }
    }
}

/// Manages the lifecycle of peer connections (inbound/outbound)
pub struct ConnectionManager {
    local_peer: PeerId,
    limits: ConnectionLimits,
    peers: DashMap<PeerId, ConnectionInfo>,
    pending: DashMap<ConnectionId, PendingConnection>,
    inbound_count: AtomicUsize,
    outbound_count: AtomicUsize,
    next_connection_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, mpsc::UnboundedSender<PeerEvent>>>,
    next_listener_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(local_peer: PeerId, limits: ConnectionLimits) -> Self {
        Self {
            local_peer,
            limits,
            peers: DashMap::new(),
            pending: DashMap::new(),
            inbound_count: AtomicUsize::new(0),
            outbound_count: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn counter(&self, direction: ConnectionDirection) -> &AtomicUsize {
        match direction {
            ConnectionDirection::Inbound => &self.inbound_count,
            ConnectionDirection::Outbound => &self.outbound_count,
        }
    }

    /// Reserve a slot for a connection attempt that has not finished its
    /// handshakes yet. Counts against the limits until established or failed.
    pub fn begin_connecting(
        &self,
        remote_addr: &str,
        direction: ConnectionDirection,
    ) -> Result<ConnectionId, ConnectionError> {
        let total = self.inbound_count.load(Ordering::Relaxed)
            + self.outbound_count.load(Ordering::Relaxed);
        if total >= self.limits.max_connections {
            return Err(ConnectionError::LimitReached(format!(
                "Max total connections reached: {}/{}",
                total, self.limits.max_connections
            )));
        }

        let (count, max) = match direction {
            ConnectionDirection::Inbound => (
                self.inbound_count.load(Ordering::Relaxed),
                self.limits.max_inbound,
            ),
            ConnectionDirection::Outbound => (
                self.outbound_count.load(Ordering::Relaxed),
                self.limits.max_outbound,
            ),
        };
        if count >= max {
            return Err(ConnectionError::LimitReached(format!(
                "Max {:?} connections reached: {}/{}",
                direction, count, max
            )));
        }

        self.counter(direction).fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(
            id,
            PendingConnection {
                remote_addr: remote_addr.to_string(),
                direction,
            },
        );
        Ok(id)
    }

    /// Release a slot whose handshake failed or timed out.
    pub fn connection_failed(&self, id: ConnectionId) {
        if let Some((_, pending)) = self.pending.remove(&id) {
            self.counter(pending.direction)
                .fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Promote an attempt to Open once the remote identity is verified.
    /// Fails with `AlreadyConnected` when the peer already has an open
    /// connection; the caller must drop the new one.
    pub fn on_connection_established(
        &self,
        id: ConnectionId,
        remote_peer: PeerId,
    ) -> Result<ConnectionInfo, ConnectionError> {
        let (_, pending) = self
            .pending
            .remove(&id)
            .ok_or(ConnectionError::UnknownAttempt(id.0))?;

        match self.peers.entry(remote_peer) {
            Entry::Occupied(_) => {
                self.counter(pending.direction)
                    .fetch_sub(1, Ordering::Relaxed);
                Err(ConnectionError::AlreadyConnected(remote_peer.short()))
            }
            Entry::Vacant(vacant) => {
                let info = ConnectionInfo {
                    id,
                    remote_peer,
                    local_peer: self.local_peer,
                    remote_addr: pending.remote_addr.clone(),
                    direction: pending.direction,
                    state: ConnectionState::Open,
                    opened_at: Instant::now(),
                };
                self.emit(PeerEvent::Connected {
                    peer: remote_peer,
                    addr: pending.remote_addr,
                    direction: pending.direction,
                });
                vacant.insert(info.clone());
                Ok(info)
            }
        }
    }

    /// Close an open connection. Stale ids (a connection that already lost a
    /// duplicate race) are ignored. Returns true if the peer left the roster.
    /// Remove the open connection `id` to `remote_peer`. Returns its final
    /// info (state `Closed`), or None if `id` is not the registered connection.
    pub fn on_connection_closed(
        &self,
        remote_peer: &PeerId,
        id: ConnectionId,
    ) -> Option<ConnectionInfo> {
        match self.peers.entry(*remote_peer) {
            Entry::Occupied(occupied) if occupied.get().id == id => {
                self.emit(PeerEvent::Disconnected { peer: *remote_peer });
                let mut info = occupied.remove();
                self.counter(info.direction).fetch_sub(1, Ordering::Relaxed);
                info.state = ConnectionState::Closed;
                Some(info)
            }
            _ => None,
        }
    }

    pub fn list_peers(&self) -> HashSet<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_info(&self, peer: &PeerId) -> Option<ConnectionInfo> {
        self.peers.get(peer).map(|entry| entry.value().clone())
    }

    pub fn connected_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register a listener. Events arrive in transition order.
    pub fn subscribe_events(&self) -> (ListenerId, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write();
        listeners.retain(|_, sender| !sender.is_closed());
        listeners.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe_events(&self, id: ListenerId) {
        self.listeners.write().remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn emit(&self, event: PeerEvent) {
        debug!("📣 Peer event: {:?}", event);
        for sender in self.listeners.read().values() {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(peer(0), ConnectionLimits::default())
    }

    #[test]
    fn test_connect_and_disconnect_events() {
        let cm = manager();
        let (_id, mut rx) = cm.subscribe_events();

        let attempt = cm
            .begin_connecting("1.2.3.4:4002", ConnectionDirection::Outbound)
            .unwrap();
        let info = cm.on_connection_established(attempt, peer(1)).unwrap();
        assert_eq!(info.state, ConnectionState::Open);
        assert_eq!(info.local_peer, peer(0));
        assert!(cm.list_peers().contains(&peer(1)));

        assert_eq!(cm.peer_info(&peer(1)).unwrap().remote_addr, "1.2.3.4:4002");
        let closed = cm.on_connection_closed(&peer(1), attempt).unwrap();
        assert_eq!(closed.state, ConnectionState::Closed);
        assert_eq!(closed.id, info.id);
        assert!(cm.list_peers().is_empty());
        assert!(cm.peer_info(&peer(1)).is_none());

        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::Connected {
                peer: peer(1),
                addr: "1.2.3.4:4002".to_string(),
                direction: ConnectionDirection::Outbound,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::Disconnected { peer: peer(1) }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_connection_rejected_without_event() {
        let cm = manager();
        let (_id, mut rx) = cm.subscribe_events();

        let first = cm
            .begin_connecting("a:1", ConnectionDirection::Outbound)
            .unwrap();
        let second = cm
            .begin_connecting("a:2", ConnectionDirection::Inbound)
            .unwrap();
        cm.on_connection_established(first, peer(1)).unwrap();
        assert!(matches!(
            cm.on_connection_established(second, peer(1)),
            Err(ConnectionError::AlreadyConnected(_))
        ));

        // Closing the loser must not tear down the winner.
        assert!(cm.on_connection_closed(&peer(1), second).is_none());
        assert!(cm.is_connected(&peer(1)));

        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Connected { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_double_close_emits_once() {
        let cm = manager();
        let (_id, mut rx) = cm.subscribe_events();
        let attempt = cm
            .begin_connecting("a:1", ConnectionDirection::Inbound)
            .unwrap();
        cm.on_connection_established(attempt, peer(2)).unwrap();
        assert!(cm.on_connection_closed(&peer(2), attempt).is_some());
        assert!(cm.on_connection_closed(&peer(2), attempt).is_none());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_limits_and_failed_attempts() {
        let cm = ConnectionManager::new(
            peer(0),
            ConnectionLimits {
                max_connections: 10,
                max_inbound: 1,
                max_outbound: 1,
            },
        );
        let a = cm
            .begin_connecting("a:1", ConnectionDirection::Inbound)
            .unwrap();
        assert!(matches!(
            cm.begin_connecting("b:1", ConnectionDirection::Inbound),
            Err(ConnectionError::LimitReached(_))
        ));
        cm.connection_failed(a);
        assert_eq!(cm.pending_count(), 0);
        assert!(cm
            .begin_connecting("b:1", ConnectionDirection::Inbound)
            .is_ok());
    }

    #[test]
    fn test_unsubscribed_listener_gets_nothing() {
        let cm = manager();
        let (id, mut rx) = cm.subscribe_events();
        let (_other, mut other_rx) = cm.subscribe_events();
        cm.unsubscribe_events(id);
        assert_eq!(cm.listener_count(), 1);

        let attempt = cm
            .begin_connecting("a:1", ConnectionDirection::Outbound)
            .unwrap();
        cm.on_connection_established(attempt, peer(3)).unwrap();

        assert!(rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }

    #[test]
    fn test_disconnect_leaves_other_peers() {
        let cm = manager();
        let a = cm
            .begin_connecting("a:1", ConnectionDirection::Outbound)
            .unwrap();
        let b = cm
            .begin_connecting("b:1", ConnectionDirection::Outbound)
            .unwrap();
        cm.on_connection_established(a, peer(1)).unwrap();
        cm.on_connection_established(b, peer(2)).unwrap();
        cm.on_connection_closed(&peer(1), a);
        assert_eq!(cm.list_peers(), [peer(2)].into_iter().collect());
        assert_eq!(cm.connected_count(), 1);
    }
}
