//! Peer identity: display names and the `name@ip:port` form.

use std::fmt;
use std::net::SocketAddr;

/// Name used when the OS gives us nothing better.
pub const FALLBACK_NAME: &str = "RandomPlayer";

/// The identity of a remote peer, derived once its greeting has arrived.
///
/// Not stored independently: it is recomputed from a live connection's
/// remote endpoint plus the name exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    /// Name the peer sent in its GREETING.
    pub name: String,
    /// Remote endpoint of the connection.
    pub addr: SocketAddr,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.addr.ip(), self.addr.port())
    }
}

/// Resolve the name this node announces and greets with.
///
/// An explicit configured name wins, then the OS account name, then
/// [`FALLBACK_NAME`].
pub fn local_display_name(configured: Option<&str>) -> String {
    if let Some(name) = configured.map(str::trim).filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match whoami::fallible::username() {
        Ok(name) if !name.trim().is_empty() => name,
        Ok(_) => FALLBACK_NAME.to_string(),
        Err(e) => {
            tracing::debug!("Cannot read OS user name: {e}");
            FALLBACK_NAME.to_string()
        }
    }
}

/// Human-readable nickname for this node: `name@hostname:port`.
pub fn nickname(name: &str, listen_port: u16) -> String {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
    format!("{name}@{host}:{listen_port}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
