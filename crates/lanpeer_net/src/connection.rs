//! FramedConnection: the per-stream handshake, framing and keep-alive task.
//!
//! Each raw stream (inbound accept or outbound connect) is driven by its own
//! tokio task. The task owns the read buffer, the decoder state and every
//! timer for that stream; nothing else touches them. Lifecycle and decoded
//! messages flow out through a single [`ConnectionEvent`] channel shared with
//! the registry, and outbound text flows in through the
//! [`ConnectionHandle`]'s message queue.
//!
//! Writes happen on a separate writer task so a peer that stops reading can
//! never hold up the stall and keep-alive timers.
//!
//! ```text
//! AwaitingGreeting ──GREETING header──▶ ReadingGreeting ──payload──▶ Ready
//!        │                                     │                      │
//!        └──── any other frame / stall ────────┴─ EOF / error / ──────┘
//!                                                pong timeout ──▶ Disconnected
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::frame::{Frame, FrameCodec, FrameKind};
use crate::identity::PeerIdentity;

/// Outbound messages a handle may queue before sends start failing.
const MESSAGE_QUEUE_SIZE: usize = 64;

/// Keep-alive frames waiting for the writer. When full, the peer is not
/// draining its socket and further pings/pongs are dropped.
const CONTROL_QUEUE_SIZE: usize = 8;

/// Initial read buffer capacity.
const READ_CHUNK: usize = 4096;

/// Process-local identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing received yet; our own greeting has been sent.
    AwaitingGreeting,
    /// A GREETING header arrived, waiting for its payload.
    ReadingGreeting,
    /// Handshake complete; MESSAGE/PING/PONG accepted.
    Ready,
}

/// Events a connection reports to the registry.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed.
    Ready {
        id: ConnectionId,
        identity: PeerIdentity,
    },
    /// A MESSAGE frame was decoded.
    Message { id: ConnectionId, text: String },
    /// The connection ended. Emitted exactly once per connection, after which
    /// no other event for `id` follows. `error` is `None` for a clean close.
    Disconnected {
        id: ConnectionId,
        error: Option<NetworkError>,
    },
}

/// Cheap, cloneable handle used to write to a running connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    messages: mpsc::Sender<String>,
    close: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint of the stream.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue `text` as a MESSAGE frame.
    ///
    /// Empty text is a no-op and returns `Ok(false)`. A write failure inside
    /// the task aborts the connection and surfaces as a disconnect.
    pub fn send_message(&self, text: &str) -> NetworkResult<bool> {
        if text.is_empty() {
            return Ok(false);
        }
        self.messages
            .try_send(text.to_string())
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NetworkError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => NetworkError::NotConnected,
            })?;
        Ok(true)
    }

    /// Ask the connection to close its stream. Never lost, however many
    /// messages are queued.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether the connection task has already exited.
    pub fn is_closed(&self) -> bool {
        self.messages.is_closed()
    }
}

/// A raw byte stream wrapped in the frame protocol.
pub struct FramedConnection<S> {
    id: ConnectionId,
    remote: SocketAddr,
    config: Arc<ConnectionConfig>,
    events: mpsc::Sender<ConnectionEvent>,
    stream: S,
    messages: mpsc::Receiver<String>,
    close: CancellationToken,
    shutdown: broadcast::Receiver<()>,
}

/// Handshake and keep-alive bookkeeping for the read side.
struct Session {
    id: ConnectionId,
    remote: SocketAddr,
    events: mpsc::Sender<ConnectionEvent>,
    control: mpsc::Sender<Frame>,
    state: ConnectionState,
    last_pong: Instant,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an already-connected stream and start its task.
    ///
    /// Our GREETING is written immediately; the returned handle is usable
    /// right away, but the registry only routes broadcasts to it once it
    /// reports [`ConnectionEvent::Ready`].
    pub fn spawn(
        id: ConnectionId,
        stream: S,
        remote: SocketAddr,
        config: Arc<ConnectionConfig>,
        events: mpsc::Sender<ConnectionEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> ConnectionHandle {
        let (handle, messages) = ConnectionHandle::new(id, remote);
        let connection = Self {
            id,
            remote,
            config,
            events,
            stream,
            messages,
            close: handle.close.clone(),
            shutdown,
        };
        tokio::spawn(connection.drive());
        handle
    }

    /// Run to completion and report the single `Disconnected` event.
    async fn drive(self) {
        let id = self.id;
        let remote = self.remote;
        let events = self.events.clone();

        let result = self.run().await;
        match &result {
            Ok(()) => debug!(%id, %remote, "Connection closed"),
            Err(e) => warn!(%id, %remote, "Connection aborted: {e}"),
        }

        let _ = events
            .send(ConnectionEvent::Disconnected {
                id,
                error: result.err(),
            })
            .await;
    }

    async fn run(self) -> NetworkResult<()> {
        let Self {
            id,
            remote,
            config,
            events,
            stream,
            messages,
            close,
            shutdown,
        } = self;

        let (reader, writer) = tokio::io::split(stream);
        let writer = FramedWrite::new(writer, FrameCodec::new(config.max_frame_size));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let mut writer_task = tokio::spawn(write_loop(
            writer,
            Frame::greeting(&config.local_name),
            control_rx,
            messages,
        ));
        debug!(%id, %remote, "Greeting queued");

        let session = Session {
            id,
            remote,
            events,
            control: control_tx,
            state: ConnectionState::AwaitingGreeting,
            last_pong: Instant::now(),
        };
        let result = read_loop(
            reader,
            session,
            &config,
            &mut writer_task,
            close,
            shutdown,
        )
        .await;

        // Dropping the writer's half is what finally closes the stream, so
        // wait for the abort to land before reporting the disconnect.
        if !writer_task.is_finished() {
            writer_task.abort();
            let _ = writer_task.await;
        }
        result
    }
}

impl FramedConnection<TcpStream> {
    /// Dial `addr` and, once connected, run the protocol on the new stream.
    ///
    /// The handle exists before the connect completes. A connect failure or
    /// timeout is reported as a `Disconnected` event like any other
    /// transport error.
    pub fn spawn_outbound(
        id: ConnectionId,
        addr: SocketAddr,
        config: Arc<ConnectionConfig>,
        events: mpsc::Sender<ConnectionEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> ConnectionHandle {
        let (handle, messages) = ConnectionHandle::new(id, addr);
        let close = handle.close.clone();
        tokio::spawn(async move {
            let timeout = config.connection_timeout;
            let connect = tokio::select! {
                result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => result,
                _ = close.cancelled() => {
                    debug!(%id, %addr, "Connect cancelled");
                    let _ = events.send(ConnectionEvent::Disconnected { id, error: None }).await;
                    return;
                }
            };
            let stream = match connect {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%id, %addr, "Connect failed: {e}");
                    let _ = events
                        .send(ConnectionEvent::Disconnected {
                            id,
                            error: Some(NetworkError::Io(e)),
                        })
                        .await;
                    return;
                }
                Err(_) => {
                    debug!(%id, %addr, "Connect timed out");
                    let _ = events
                        .send(ConnectionEvent::Disconnected {
                            id,
                            error: Some(NetworkError::ConnectTimeout { addr, timeout }),
                        })
                        .await;
                    return;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%id, %addr, "Failed to set TCP_NODELAY: {e}");
            }

            let connection = Self {
                id,
                remote: addr,
                config,
                events,
                stream,
                messages,
                close,
                shutdown,
            };
            connection.drive().await;
        });
        handle
    }
}

impl ConnectionHandle {
    fn new(id: ConnectionId, remote: SocketAddr) -> (Self, mpsc::Receiver<String>) {
        let (messages, rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
        let handle = Self {
            id,
            remote,
            messages,
            close: CancellationToken::new(),
        };
        (handle, rx)
    }
}

/// Read, decode and time the stream until it ends. Never awaits a write.
async fn read_loop<R>(
    mut reader: R,
    mut session: Session,
    config: &ConnectionConfig,
    writer_task: &mut JoinHandle<NetworkResult<()>>,
    close: CancellationToken,
    mut shutdown: broadcast::Receiver<()>,
) -> NetworkResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new(config.max_frame_size);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    // The handshake itself is bounded by the stall timeout.
    let mut stall_deadline = Some(Instant::now() + config.stall_timeout);
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                let n = read?;
                let was_ready = session.state == ConnectionState::Ready;

                if n == 0 {
                    while let Some(frame) = codec.decode_eof(&mut buf)? {
                        session.on_frame(frame).await?;
                    }
                    return Ok(());
                }

                while let Some(frame) = codec.decode(&mut buf)? {
                    session.on_frame(frame).await?;
                }
                session.check_header(&codec)?;

                if !was_ready && session.state == ConnectionState::Ready {
                    ping.reset();
                }

                let mid_frame = !codec.is_idle() || !buf.is_empty();
                stall_deadline = if mid_frame || session.state != ConnectionState::Ready {
                    Some(Instant::now() + config.stall_timeout)
                } else {
                    None
                };
            }

            _ = tokio::time::sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                if stall_deadline.is_some() =>
            {
                return Err(NetworkError::StallTimeout(config.stall_timeout));
            }

            _ = ping.tick(), if session.state == ConnectionState::Ready => {
                if session.last_pong.elapsed() > config.pong_timeout {
                    return Err(NetworkError::PongTimeout(config.pong_timeout));
                }
                session.queue_control(Frame::ping());
            }

            written = &mut *writer_task => {
                return match written {
                    Ok(result) => result,
                    Err(e) => Err(NetworkError::Io(std::io::Error::other(e))),
                };
            }

            _ = close.cancelled() => return Ok(()),

            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// Writer task: our GREETING first, then keep-alive frames ahead of queued
/// messages. Ends cleanly once every handle is gone.
async fn write_loop<W>(
    mut writer: FramedWrite<W, FrameCodec>,
    greeting: Frame,
    mut control: mpsc::Receiver<Frame>,
    mut messages: mpsc::Receiver<String>,
) -> NetworkResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.send(greeting).await?;
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control.recv() => frame,
            message = messages.recv() => match message {
                Some(text) => Frame::message(&text),
                None => return Ok(()),
            },
        };
        writer.send(frame).await?;
    }
}

impl Session {
    /// Reject a non-greeting header as soon as its type token is known.
    fn check_header(&mut self, codec: &FrameCodec) -> NetworkResult<()> {
        if self.state == ConnectionState::Ready {
            return Ok(());
        }
        match codec.pending_kind() {
            Some(FrameKind::Greeting) => {
                self.state = ConnectionState::ReadingGreeting;
                Ok(())
            }
            Some(kind) => Err(NetworkError::UnexpectedFrame(kind.to_string())),
            None => Ok(()),
        }
    }

    /// Hand a keep-alive frame to the writer without waiting on it.
    fn queue_control(&self, frame: Frame) {
        if let Err(mpsc::error::TrySendError::Full(frame)) = self.control.try_send(frame) {
            debug!(id = %self.id, kind = %frame.kind, "Writer backlogged, dropping frame");
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> NetworkResult<()> {
        match (self.state, frame.kind) {
            (ConnectionState::Ready, FrameKind::Message) => {
                let _ = self
                    .events
                    .send(ConnectionEvent::Message {
                        id: self.id,
                        text: frame.text(),
                    })
                    .await;
            }
            (ConnectionState::Ready, FrameKind::Ping) => {
                self.queue_control(Frame::pong());
            }
            (ConnectionState::Ready, FrameKind::Pong) => {
                self.last_pong = Instant::now();
            }
            (ConnectionState::Ready, FrameKind::Greeting) => {
                debug!(id = %self.id, "Ignoring repeated greeting");
            }
            (_, FrameKind::Greeting) => {
                let identity = PeerIdentity::new(frame.text(), self.remote);
                info!(id = %self.id, peer = %identity, "Handshake complete");
                self.state = ConnectionState::Ready;
                self.last_pong = Instant::now();
                let _ = self
                    .events
                    .send(ConnectionEvent::Ready {
                        id: self.id,
                        identity,
                    })
                    .await;
            }
            (_, kind) => return Err(NetworkError::UnexpectedFrame(kind.to_string())),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
