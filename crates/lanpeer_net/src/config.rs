//! Network configuration for a lanpeer node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known UDP port shared by every instance for discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 45000;

/// Largest payload length a peer may declare.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1_024_000;

/// Configuration for the lanpeer networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name announced to other peers. `None` uses the OS account name.
    pub display_name: Option<String>,

    /// Address to listen on for incoming TCP connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// Interval between discovery announcements.
    #[serde(with = "duration_ms_serde")]
    pub broadcast_interval: Duration,

    /// How long a partially received frame may sit without progress.
    #[serde(with = "duration_ms_serde")]
    pub stall_timeout: Duration,

    /// Interval between keep-alive pings.
    #[serde(with = "duration_ms_serde")]
    pub ping_interval: Duration,

    /// A peer that has not answered a ping within this bound is dropped.
    #[serde(with = "duration_ms_serde")]
    pub pong_timeout: Duration,

    /// Timeout for establishing an outbound TCP connection.
    #[serde(with = "duration_ms_serde")]
    pub connection_timeout: Duration,

    /// Maximum declared payload length accepted from a peer.
    pub max_frame_size: usize,

    /// Peer addresses (`ip:port`) to dial on startup.
    pub known_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_enabled: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: Duration::from_millis(2000),
            stall_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }

    /// The per-connection subset of this config.
    pub fn connection_config(&self, local_name: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            local_name: local_name.into(),
            stall_timeout: self.stall_timeout,
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            connection_timeout: self.connection_timeout,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// Settings every [`FramedConnection`](crate::connection::FramedConnection)
/// is created with.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Display name sent in our GREETING.
    pub local_name: String,
    pub stall_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        NetworkConfig::default().connection_config(crate::identity::FALLBACK_NAME)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.discovery_enabled);
        assert_eq!(config.discovery_port, 45000);
        assert_eq!(config.broadcast_interval, Duration::from_millis(2000));
        assert_eq!(config.stall_timeout, Duration::from_secs(30));
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
        assert!(config.known_peers.is_empty());
        assert!(config.display_name.is_none());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = NetworkConfig::default();
        config.display_name = Some("jane".to_string());
        config.broadcast_interval = Duration::from_millis(750);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.display_name.as_deref(), Some("jane"));
        assert_eq!(deserialized.broadcast_interval, Duration::from_millis(750));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{"discovery_port": 46000, "ping_interval": 1000}"#).unwrap();
        assert_eq!(config.discovery_port, 46000);
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut original = NetworkConfig::default();
        original.max_frame_size = 4096;
        original.known_peers = vec!["192.168.1.100:5000".to_string()];
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert_eq!(loaded.max_frame_size, 4096);
        assert_eq!(loaded.known_peers.len(), 1);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
    }

    #[test]
    fn test_connection_config_copies_timeouts() {
        let mut config = NetworkConfig::default();
        config.stall_timeout = Duration::from_secs(3);
        let conn = config.connection_config("bob");
        assert_eq!(conn.local_name, "bob");
        assert_eq!(conn.stall_timeout, Duration::from_secs(3));
        assert_eq!(conn.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }
}
