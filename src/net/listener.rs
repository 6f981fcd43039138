use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::error::Error;
use crate::net::peer::PeerRegistry;
use crate::worker::Worker;

/// TCP server for incoming peer connections.
///
/// Accepted sockets are handed to the peer registry, which requires a
/// valid handshake before the connection becomes visible to the router.
pub struct TcpServer {
    worker: Worker,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind the server socket and start the accept worker. Port 0 selects
    /// an ephemeral port; the actual port is available via [`TcpServer::port`].
    pub async fn start(
        bind_host: &str,
        port: u16,
        peers: Arc<PeerRegistry>,
    ) -> Result<TcpServer, Error> {
        let listener = TcpListener::bind((bind_host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("tcp server listening on {}", local_addr);

        let worker = Worker::spawn("tcp-server", move |stop| async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = stop.wait() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("accept failed: {}", err);
                            continue;
                        }
                    },
                };
                // Handshake handling must not stall the accept loop.
                let peers = Arc::clone(&peers);
                tokio::spawn(async move {
                    if let Err(err) = peers.adopt_incoming(stream).await {
                        warn!("rejected connection from {}: {}", remote, err);
                    }
                });
            }
            Ok(())
        });
        Ok(TcpServer { worker, local_addr })
    }

    /// Actual TCP port the server is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting new connections. Existing peer connections are
    /// unaffected.
    pub async fn stop(&self) -> Result<(), Error> {
        self.worker.stop_and_join(Some(Duration::from_secs(2))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::PeerOptions;
    use crate::router::MessageRouter;

    #[tokio::test]
    async fn binds_ephemeral_port() {
        let peers = PeerRegistry::new("srv", "default", PeerOptions::default());
        let _router = MessageRouter::new("srv", Arc::clone(&peers));
        let server = TcpServer::start("127.0.0.1", 0, peers).await.unwrap();
        assert_ne!(server.port(), 0);
        server.stop().await.unwrap();
    }
}
