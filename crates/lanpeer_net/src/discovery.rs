//! LAN peer discovery via UDP broadcast.
//!
//! The [`Discoverer`] periodically broadcasts a `name@port` announcement to
//! the broadcast address of every local IPv4 interface and listens on the
//! same well-known port for announcements from other nodes. A valid
//! announcement from a node we have no connection to yet results in exactly
//! one outbound connection attempt, registered with the [`PeerRegistry`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::registry::PeerRegistry;

/// Separator between the name and the port in an announcement.
pub const ANNOUNCEMENT_SEPARATOR: u8 = b'@';

/// Receive buffer size; announcements are far smaller.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// A node's announcement: its display name and TCP listen port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: String,
    pub port: u16,
}

impl Announcement {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// Serialize as `name@port`, with no trailing delimiter.
    pub fn encode(&self) -> Vec<u8> {
        format!("{}@{}", self.name, self.port).into_bytes()
    }

    /// Parse a datagram. Anything that is not exactly two `@`-separated
    /// fields with a non-zero integer port is rejected.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let mut fields = datagram.split(|b| *b == ANNOUNCEMENT_SEPARATOR);
        let name = fields.next()?;
        let port = fields.next()?;
        if fields.next().is_some() {
            return None;
        }

        let port = std::str::from_utf8(port)
            .ok()?
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)?;

        Some(Self {
            name: String::from_utf8_lossy(name).into_owned(),
            port,
        })
    }
}

/// The node's own non-loopback IPv4 addresses and their subnet broadcast
/// addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalAddresses {
    pub ips: Vec<IpAddr>,
    pub broadcasts: Vec<Ipv4Addr>,
}

impl LocalAddresses {
    /// Enumerate the interfaces. Failure yields an empty set, which simply
    /// makes broadcasting a no-op until the next rescan.
    pub fn scan() -> Self {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                debug!("Interface enumeration failed: {e}");
                return Self::default();
            }
        };

        let mut addresses = Self::default();
        for iface in interfaces {
            if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                if v4.ip.is_loopback() {
                    continue;
                }
                if let Some(broadcast) = v4.broadcast {
                    addresses.ips.push(IpAddr::V4(v4.ip));
                    addresses.broadcasts.push(broadcast);
                }
            }
        }
        addresses
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.ips.contains(&ip)
    }
}

/// What the discoverer did with one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not a valid announcement.
    Malformed,
    /// Our own broadcast looping back.
    OwnAnnouncement,
    /// A connection to that address already exists or is being set up.
    AlreadyConnected,
    /// An outbound connection attempt was started.
    Connect(SocketAddr),
}

/// Configuration for the discoverer.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast an announcement.
    pub interval: Duration,
    /// Our own announcement to broadcast.
    pub announcement: Announcement,
}

/// LAN discovery service using UDP broadcast.
pub struct Discoverer {
    config: DiscoveryConfig,
    registry: PeerRegistry,
    addresses: Mutex<LocalAddresses>,
}

impl Discoverer {
    /// Create a discoverer using the current interface addresses.
    pub fn new(config: DiscoveryConfig, registry: PeerRegistry) -> Self {
        Self::with_addresses(config, registry, LocalAddresses::scan())
    }

    pub fn with_addresses(
        config: DiscoveryConfig,
        registry: PeerRegistry,
        addresses: LocalAddresses,
    ) -> Self {
        Self {
            config,
            registry,
            addresses: Mutex::new(addresses),
        }
    }

    /// Bind the shared discovery socket and spawn the broadcaster and the
    /// listener. Both tasks exit when `shutdown` fires.
    pub fn start(self, shutdown: &broadcast::Sender<()>) -> NetworkResult<()> {
        let socket = Arc::new(bind_shared(self.config.port)?);
        info!(
            port = self.config.port,
            name = %self.config.announcement.name,
            "Discovery listening"
        );

        let discoverer = Arc::new(self);

        let bcast = Arc::clone(&discoverer);
        let bcast_socket = Arc::clone(&socket);
        let mut bcast_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(bcast.config.interval) => {
                        bcast.announce(&bcast_socket).await;
                    }
                    _ = bcast_shutdown.recv() => {
                        debug!("Discovery broadcaster shutting down");
                        break;
                    }
                }
            }
        });

        let mut listen_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            discoverer.handle_datagram(&buf[..len], source);
                        }
                        Err(e) => warn!("Discovery recv error: {e}"),
                    },
                    _ = listen_shutdown.recv() => {
                        debug!("Discovery listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Send one announcement to every known broadcast address.
    ///
    /// Any send failure, or having no addresses at all, triggers a rescan
    /// of the local interfaces before the next tick.
    async fn announce(&self, socket: &UdpSocket) {
        let payload = self.config.announcement.encode();
        let targets = self.addresses.lock().broadcasts.clone();

        let mut all_sent = !targets.is_empty();
        for target in targets {
            match socket.send_to(&payload, (target, self.config.port)).await {
                Ok(_) => trace!(%target, "Announcement sent"),
                Err(e) => {
                    debug!(%target, "Announcement send failed: {e}");
                    all_sent = false;
                }
            }
        }

        if !all_sent {
            let rescanned = LocalAddresses::scan();
            debug!(
                broadcasts = rescanned.broadcasts.len(),
                "Rescanned local addresses"
            );
            *self.addresses.lock() = rescanned;
        }
    }

    /// Decide what a datagram from `source` calls for, without acting.
    pub fn evaluate(&self, datagram: &[u8], source: SocketAddr) -> Decision {
        let Some(announcement) = Announcement::parse(datagram) else {
            return Decision::Malformed;
        };

        let ip = source.ip();
        let own_port = announcement.port == self.config.announcement.port;
        if own_port && self.addresses.lock().contains(ip) {
            return Decision::OwnAnnouncement;
        }

        if self.registry.is_known(ip) {
            return Decision::AlreadyConnected;
        }

        Decision::Connect(SocketAddr::new(ip, announcement.port))
    }

    /// Evaluate a datagram and start a connection when warranted.
    pub fn handle_datagram(&self, datagram: &[u8], source: SocketAddr) -> Decision {
        let decision = self.evaluate(datagram, source);
        match &decision {
            Decision::Connect(addr) => {
                debug!(%source, %addr, "Discovered new peer, connecting");
                self.registry.connect(*addr);
            }
            Decision::Malformed => trace!(%source, "Ignoring malformed datagram"),
            Decision::OwnAnnouncement | Decision::AlreadyConnected => {}
        }
        decision
    }
}

/// Bind the discovery port with address (and, where supported, port) reuse
/// so several local instances can share it.
fn bind_shared(port: u16) -> NetworkResult<UdpSocket> {
    let discovery =
        |what: &str, e: std::io::Error| NetworkError::Discovery(format!("{what}: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| discovery("Socket create", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| discovery("Set reuse address", e))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|e| discovery("Set reuse port", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| discovery("Set broadcast", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| discovery("Set nonblocking", e))?;

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| discovery("Bind failed", e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| discovery("Register socket", e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::ConnectionConfig;

    const OWN_PORT: u16 = 5555;

    fn discoverer(addresses: LocalAddresses) -> (Discoverer, broadcast::Sender<()>) {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (registry, _events) =
            PeerRegistry::spawn(ConnectionConfig::default(), shutdown_tx.clone());
        let config = DiscoveryConfig {
            port: 45000,
            interval: Duration::from_secs(2),
            announcement: Announcement::new("me", OWN_PORT),
        };
        (
            Discoverer::with_addresses(config, registry, addresses),
            shutdown_tx,
        )
    }

    fn lan() -> LocalAddresses {
        LocalAddresses {
            ips: vec!["192.168.1.5".parse().unwrap()],
            broadcasts: vec!["192.168.1.255".parse().unwrap()],
        }
    }

    #[test]
    fn test_announcement_encode() {
        assert_eq!(Announcement::new("bob", 5000).encode(), b"bob@5000");
    }

    #[test]
    fn test_announcement_parse() {
        assert_eq!(
            Announcement::parse(b"bob@5000"),
            Some(Announcement::new("bob", 5000))
        );
        assert_eq!(Announcement::parse(b"garbage"), None);
        assert_eq!(Announcement::parse(b"a@b@5000"), None);
        assert_eq!(Announcement::parse(b"bob@port"), None);
        assert_eq!(Announcement::parse(b"bob@"), None);
        assert_eq!(Announcement::parse(b"bob@70000"), None);
        assert_eq!(Announcement::parse(b"bob@0"), None);
        assert_eq!(Announcement::parse(b""), None);
    }

    #[tokio::test]
    async fn test_own_announcement_ignored() {
        let (discoverer, _shutdown) = discoverer(lan());
        let source: SocketAddr = "192.168.1.5:45000".parse().unwrap();
        let datagram = Announcement::new("me", OWN_PORT).encode();
        assert_eq!(
            discoverer.handle_datagram(&datagram, source),
            Decision::OwnAnnouncement
        );
        assert_eq!(discoverer.registry.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_second_instance_on_same_host_is_not_self() {
        let (discoverer, _shutdown) = discoverer(lan());
        let source: SocketAddr = "192.168.1.5:45000".parse().unwrap();
        assert_eq!(
            discoverer.evaluate(b"me@6000", source),
            Decision::Connect("192.168.1.5:6000".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_malformed_datagram_takes_no_action() {
        let (discoverer, _shutdown) = discoverer(lan());
        let source: SocketAddr = "192.168.1.9:45000".parse().unwrap();
        assert_eq!(
            discoverer.handle_datagram(b"garbage", source),
            Decision::Malformed
        );
        assert_eq!(discoverer.registry.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_announcement_connects_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (discoverer, _shutdown) = discoverer(LocalAddresses::default());

        let source: SocketAddr = "127.0.0.1:45000".parse().unwrap();
        let datagram = format!("bob@{port}");
        assert_eq!(
            discoverer.handle_datagram(datagram.as_bytes(), source),
            Decision::Connect(SocketAddr::new(source.ip(), port))
        );
        for _ in 0..5 {
            assert_eq!(
                discoverer.handle_datagram(datagram.as_bytes(), source),
                Decision::AlreadyConnected
            );
        }

        let first = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
        assert!(first.is_ok(), "expected one outbound connection");
        let second = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(second.is_err(), "repeated announcements must not reconnect");
    }

    #[tokio::test]
    async fn test_shared_bind_allows_two_sockets() {
        let probe = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let first = bind_shared(port).unwrap();
        let second = bind_shared(port);
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn test_udp_loopback_announcement() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let sent = Announcement::new("loopback", 4242);
        socket.send_to(&sent.encode(), addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(Announcement::parse(&buf[..len]), Some(sent));
    }
}
