//! PeerNode: top-level coordinator for the networking layer.
//!
//! [`PeerNode`] is the application-facing API of lanpeer_net. It wires up:
//! - the TCP accept loop ([`PassiveListener`])
//! - the connection registry ([`PeerRegistry`])
//! - LAN discovery ([`Discoverer`])
//! - bootstrap dialing of `known_peers`

use std::net::{IpAddr, SocketAddr};

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::connection::ConnectionId;
use crate::discovery::{Announcement, Discoverer, DiscoveryConfig};
use crate::error::{NetworkError, NetworkResult};
use crate::identity;
use crate::listener::PassiveListener;
use crate::registry::{NodeEvent, PeerRegistry, PeerSnapshot};

/// Everything that only exists while the node is running.
struct Running {
    registry: PeerRegistry,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

/// A lanpeer network node.
///
/// Create one per application instance and call [`start()`](PeerNode::start)
/// to begin accepting connections and discovering peers.
pub struct PeerNode {
    config: NetworkConfig,
    /// Name sent in GREETING frames and discovery announcements.
    display_name: String,
    running: Option<Running>,
}

impl PeerNode {
    pub fn new(config: NetworkConfig) -> Self {
        let display_name = identity::local_display_name(config.display_name.as_deref());
        Self {
            config,
            display_name,
            running: None,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// `name@hostname:port`, while running.
    pub fn nickname(&self) -> Option<String> {
        self.local_addr()
            .map(|addr| identity::nickname(&self.display_name, addr.port()))
    }

    /// Start listening, discovery and bootstrap dialing.
    ///
    /// Returns the receiver for [`NodeEvent`]s, or `None` when the node was
    /// already running.
    pub async fn start(&mut self) -> NetworkResult<Option<mpsc::Receiver<NodeEvent>>> {
        if self.running.is_some() {
            return Ok(None);
        }

        let (shutdown_tx, _) = broadcast::channel(8);
        let listener = PassiveListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr();

        let (registry, events) = PeerRegistry::spawn(
            self.config.connection_config(self.display_name.clone()),
            shutdown_tx.clone(),
        );
        listener.spawn(registry.clone(), shutdown_tx.subscribe());

        if self.config.discovery_enabled {
            let discovery_config = DiscoveryConfig {
                port: self.config.discovery_port,
                interval: self.config.broadcast_interval,
                announcement: Announcement::new(self.display_name.clone(), local_addr.port()),
            };
            let discoverer = Discoverer::new(discovery_config, registry.clone());
            if let Err(e) = discoverer.start(&shutdown_tx) {
                warn!("Discovery start failed (non-fatal): {e}");
            }
        }

        for peer in &self.config.known_peers {
            match peer.parse::<SocketAddr>() {
                Ok(addr) => {
                    registry.connect(addr);
                }
                Err(e) => warn!("Ignoring invalid known peer {peer:?}: {e}"),
            }
        }

        self.running = Some(Running {
            registry,
            shutdown_tx,
            local_addr,
        });
        info!(
            name = %self.display_name,
            addr = %local_addr,
            discovery = self.config.discovery_enabled,
            "PeerNode started"
        );
        Ok(Some(events))
    }

    /// Stop the node, closing every connection and background task.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.registry.close_all();
        let _ = running.shutdown_tx.send(());
        info!(name = %self.display_name, "PeerNode stopped");
    }

    fn registry(&self) -> NetworkResult<&PeerRegistry> {
        self.running
            .as_ref()
            .map(|r| &r.registry)
            .ok_or(NetworkError::NotRunning)
    }

    /// Send `text` to every established peer. Returns the number of peers it
    /// was queued for.
    pub fn send_to_all_peers(&self, text: &str) -> NetworkResult<usize> {
        Ok(self.registry()?.broadcast(text))
    }

    /// Whether an established connection to `ip` (and `port`) exists.
    pub fn is_connected_to(&self, ip: IpAddr, port: Option<u16>) -> bool {
        self.registry()
            .map(|r| r.has_connection(ip, port))
            .unwrap_or(false)
    }

    /// Dial a peer directly.
    pub fn connect_to(&self, addr: SocketAddr) -> NetworkResult<ConnectionId> {
        Ok(self.registry()?.connect(addr))
    }

    /// Snapshot of established peers; empty when stopped.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.registry().map(PeerRegistry::peers).unwrap_or_default()
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
