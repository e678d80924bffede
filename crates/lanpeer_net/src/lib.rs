//! lanpeer_net: serverless LAN peer-to-peer messaging.
//!
//! Nodes find each other with UDP broadcast announcements and talk over
//! plain TCP using a small length-prefixed frame protocol.
//!
//! # Architecture
//!
//! - **Framing**: `<TYPE> <LENGTH> <PAYLOAD>` frames, decoded incrementally
//!   by [`frame::FrameCodec`].
//! - **Connections**: one task per stream ([`FramedConnection`]) running the
//!   GREETING handshake, the PING/PONG keep-alive and the stall timeout.
//! - **Registry**: [`PeerRegistry`] tracks established peers and fans
//!   messages out to them.
//! - **Discovery**: [`Discoverer`] broadcasts `name@port` and dials newly
//!   seen peers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanpeer_net::{NetworkConfig, NodeEvent, PeerNode};
//!
//! # async fn example() -> lanpeer_net::NetworkResult<()> {
//! let mut node = PeerNode::new(NetworkConfig::default());
//! if let Some(mut events) = node.start().await? {
//!     while let Some(event) = events.recv().await {
//!         if let NodeEvent::MessageReceived { from, text } = event {
//!             println!("{from}: {text}");
//!         }
//!     }
//! }
//! node.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod identity;
pub mod listener;
pub mod node;
pub mod registry;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{ConnectionConfig, NetworkConfig};
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionId, FramedConnection};
pub use discovery::{Announcement, Discoverer};
pub use error::{NetworkError, NetworkResult};
pub use frame::{Frame, FrameKind};
pub use identity::PeerIdentity;
pub use listener::PassiveListener;
pub use node::PeerNode;
pub use registry::{NodeEvent, PeerRegistry, PeerSnapshot};
