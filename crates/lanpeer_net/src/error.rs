//! Network error types.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in the lanpeer_net crate.
///
/// Every per-connection variant is fatal to that connection only; the
/// registry learns about it through a `Disconnected` event and never acts on
/// the reason beyond logging it.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The peer sent a type token that is not one of the four known frames.
    #[error("Unknown frame type: {0:?}")]
    UnknownFrameType(String),

    /// The length token was missing or not a decimal integer.
    #[error("Invalid frame length: {0:?}")]
    InvalidLength(String),

    /// A header token grew past the allowed size without a separator.
    #[error("Header token exceeds {max} bytes")]
    HeaderTooLong { max: usize },

    /// The declared payload length is larger than we are willing to buffer.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The first frame on a connection was not a greeting.
    #[error("Unexpected frame during handshake: expected GREETING, got {0}")]
    UnexpectedFrame(String),

    /// The stream ended in the middle of a frame.
    #[error("Stream closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    /// A partially received frame (or the handshake) made no progress in time.
    #[error("Stalled for {0:?} waiting for frame data")]
    StallTimeout(Duration),

    /// No pong arrived within the liveness bound.
    #[error("No pong received within {0:?}")]
    PongTimeout(Duration),

    /// Outbound connect did not complete in time.
    #[error("Connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The connection task has already ended.
    #[error("Connection closed")]
    NotConnected,

    /// The connection's outbound queue is full.
    #[error("Send queue full")]
    QueueFull,

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for networking operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
