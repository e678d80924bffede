//! Peer registry: tracks live connections and fans messages out to them.
//!
//! Every connection is registered the moment its raw stream exists, before
//! the handshake, so that its lifecycle events are funnelled through the
//! registry's single event loop. A connection is *promoted* to established
//! when it reports `Ready`, and only established connections receive
//! broadcasts or have their messages surfaced to the application.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionId, FramedConnection};
use crate::identity::PeerIdentity;

/// Capacity of the connection → registry and registry → application channels.
const EVENT_QUEUE_SIZE: usize = 256;

/// Events surfaced to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A connection completed its handshake and was promoted.
    PeerJoined(PeerIdentity),
    /// An established connection ended.
    PeerLeft(PeerIdentity),
    /// A MESSAGE arrived on an established connection.
    MessageReceived { from: PeerIdentity, text: String },
}

/// Point-in-time view of one established peer.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: ConnectionId,
    pub identity: PeerIdentity,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Established {
    id: ConnectionId,
    identity: PeerIdentity,
    connected_at: DateTime<Utc>,
}

/// State guarded by the registry lock.
#[derive(Debug, Default)]
struct RegistryState {
    /// Every registered connection, established or still handshaking.
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Established connections, listed per remote address.
    established: HashMap<IpAddr, Vec<Established>>,
}

impl RegistryState {
    fn has_connection(&self, ip: IpAddr, port: Option<u16>) -> bool {
        match (self.established.get(&ip), port) {
            (None, _) => false,
            (Some(list), None) => !list.is_empty(),
            (Some(list), Some(port)) => list.iter().any(|e| e.identity.addr.port() == port),
        }
    }

    fn find_established(&self, id: ConnectionId) -> Option<&Established> {
        self.established.values().flatten().find(|e| e.id == id)
    }

    /// Promote `id`. Returns false if another connection already owns the
    /// same remote address and port.
    fn promote(&mut self, id: ConnectionId, identity: PeerIdentity) -> bool {
        if self.has_connection(identity.addr.ip(), Some(identity.addr.port())) {
            return false;
        }
        self.established
            .entry(identity.addr.ip())
            .or_default()
            .push(Established {
                id,
                identity,
                connected_at: Utc::now(),
            });
        true
    }

    /// Forget `id` entirely. Returns the established entry if there was one.
    fn remove(&mut self, id: ConnectionId) -> Option<Established> {
        self.connections.remove(&id);

        let ip = self.find_established(id)?.identity.addr.ip();
        let list = self.established.get_mut(&ip)?;
        let pos = list.iter().position(|e| e.id == id)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            self.established.remove(&ip);
        }
        Some(removed)
    }
}

struct Inner {
    state: Mutex<RegistryState>,
    config: Arc<ConnectionConfig>,
    conn_tx: mpsc::Sender<ConnectionEvent>,
    shutdown: broadcast::Sender<()>,
    next_id: AtomicU64,
}

/// Registry of all live connections. Cloning shares the same registry.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

impl PeerRegistry {
    /// Create the registry and start its event loop.
    ///
    /// Returns the receiver on which [`NodeEvent`]s are delivered. The loop,
    /// and every connection registered here, exits when `shutdown` fires.
    pub fn spawn(
        config: ConnectionConfig,
        shutdown: broadcast::Sender<()>,
    ) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (conn_tx, conn_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (node_tx, node_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let loop_shutdown = shutdown.subscribe();

        let registry = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RegistryState::default()),
                config: Arc::new(config),
                conn_tx,
                shutdown,
                next_id: AtomicU64::new(1),
            }),
        };

        tokio::spawn(
            registry
                .clone()
                .event_loop(conn_rx, node_tx, loop_shutdown),
        );
        (registry, node_rx)
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register an inbound stream and start its protocol task.
    pub fn attach<S>(&self, stream: S, remote: SocketAddr) -> ConnectionId
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_id();
        // Hold the lock across spawn so the handle is in place before the
        // task can report anything.
        let mut state = self.inner.state.lock();
        let handle = FramedConnection::spawn(
            id,
            stream,
            remote,
            Arc::clone(&self.inner.config),
            self.inner.conn_tx.clone(),
            self.inner.shutdown.subscribe(),
        );
        state.connections.insert(id, handle);
        debug!(%id, %remote, "Registered inbound connection");
        id
    }

    /// Register an outbound connection attempt to `addr`.
    pub fn connect(&self, addr: SocketAddr) -> ConnectionId {
        let id = self.next_id();
        let mut state = self.inner.state.lock();
        let handle = FramedConnection::spawn_outbound(
            id,
            addr,
            Arc::clone(&self.inner.config),
            self.inner.conn_tx.clone(),
            self.inner.shutdown.subscribe(),
        );
        state.connections.insert(id, handle);
        debug!(%id, %addr, "Registered outbound connection");
        id
    }

    /// Whether an established connection exists to `ip` (and `port`, when
    /// given).
    pub fn has_connection(&self, ip: IpAddr, port: Option<u16>) -> bool {
        self.inner.state.lock().has_connection(ip, port)
    }

    /// Whether any registered connection, established or still
    /// handshaking, has `ip` as its remote address.
    pub fn is_known(&self, ip: IpAddr) -> bool {
        let state = self.inner.state.lock();
        state.has_connection(ip, None)
            || state.connections.values().any(|h| h.remote().ip() == ip)
    }

    /// Send `text` to every established connection. Returns how many
    /// connections accepted it; a failure on one does not affect the rest.
    pub fn broadcast(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let state = self.inner.state.lock();
        let mut sent = 0;
        for entry in state.established.values().flatten() {
            let Some(handle) = state.connections.get(&entry.id) else {
                continue;
            };
            match handle.send_message(text) {
                Ok(_) => sent += 1,
                Err(e) => {
                    warn!(id = %entry.id, peer = %entry.identity, "Broadcast send failed: {e}");
                }
            }
        }
        sent
    }

    /// Snapshot of the established peers.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let state = self.inner.state.lock();
        let mut peers: Vec<PeerSnapshot> = state
            .established
            .values()
            .flatten()
            .map(|e| PeerSnapshot {
                id: e.id,
                identity: e.identity.clone(),
                connected_at: e.connected_at,
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Number of established connections.
    pub fn connected_count(&self) -> usize {
        self.inner.state.lock().established.values().map(Vec::len).sum()
    }

    /// Number of registered connections, including those still handshaking.
    pub fn registered_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Ask every registered connection to close.
    pub fn close_all(&self) {
        let state = self.inner.state.lock();
        for handle in state.connections.values() {
            handle.close();
        }
    }

    /// Apply one connection event to the registry state, returning what the
    /// application should hear about it.
    fn apply(&self, event: ConnectionEvent) -> Option<NodeEvent> {
        let mut state = self.inner.state.lock();
        match event {
            ConnectionEvent::Ready { id, identity } => {
                let Some(handle) = state.connections.get(&id).cloned() else {
                    return None;
                };
                if state.promote(id, identity.clone()) {
                    info!(%id, peer = %identity, "Peer joined");
                    Some(NodeEvent::PeerJoined(identity))
                } else {
                    debug!(%id, peer = %identity, "Duplicate connection to same endpoint, closing");
                    handle.close();
                    None
                }
            }
            ConnectionEvent::Message { id, text } => {
                let from = state.find_established(id)?.identity.clone();
                debug!(%id, peer = %from, bytes = text.len(), "Message received");
                Some(NodeEvent::MessageReceived { from, text })
            }
            ConnectionEvent::Disconnected { id, error } => {
                if let Some(e) = &error {
                    debug!(%id, "Connection ended with error: {e}");
                }
                let removed = state.remove(id)?;
                info!(%id, peer = %removed.identity, "Peer left");
                Some(NodeEvent::PeerLeft(removed.identity))
            }
        }
    }

    async fn event_loop(
        self,
        mut conn_rx: mpsc::Receiver<ConnectionEvent>,
        node_tx: mpsc::Sender<NodeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = conn_rx.recv() => {
                    if let Some(node_event) = self.apply(event) {
                        let _ = node_tx.send(node_event).await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Registry event loop shutting down");
                    break;
                }
            }
        }
        self.close_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
