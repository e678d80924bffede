//! TCP accept loop handing raw streams to the registry.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::NetworkResult;
use crate::registry::PeerRegistry;

/// Listens for inbound peer connections.
pub struct PassiveListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PassiveListener {
    /// Bind to `addr`. Port 0 lets the OS choose; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Listening for peers");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop until `shutdown` fires. Every accepted stream is
    /// registered with `registry`, which owns it from then on.
    pub fn spawn(
        self,
        registry: PeerRegistry,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(registry, shutdown))
    }

    async fn run(self, registry: PeerRegistry, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%remote, "Cannot set TCP_NODELAY: {e}");
                        }
                        let id = registry.attach(stream, remote);
                        debug!(%id, %remote, "Accepted connection");
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
                _ = shutdown.recv() => {
                    debug!(addr = %self.local_addr, "Listener shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpStream;

    use super::*;
    use crate::config::ConnectionConfig;

    #[tokio::test]
    async fn test_bind_reports_assigned_port() {
        let listener = PassiveListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_accepted_stream_is_registered() {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (registry, _events) =
            PeerRegistry::spawn(ConnectionConfig::default(), shutdown_tx.clone());

        let listener = PassiveListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let task = listener.spawn(registry.clone(), shutdown_tx.subscribe());

        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if registry.registered_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.registered_count(), 1);
        assert!(registry.is_known("127.0.0.1".parse().unwrap()));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
