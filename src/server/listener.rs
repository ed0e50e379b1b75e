use super::session::WireSession;
use crate::core::Result;
use crate::router::QueryRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Accepts client connections and supervises one session task per socket
pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<QueryRouter>,
    metrics: Arc<ServerMetrics>,
}

#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_accepted: AtomicU64,
    sessions_failed: AtomicU64,
}

impl ServerMetrics {
    fn on_connection(&self) -> u64 {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn on_session_failure(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }
}

impl ProxyServer {
    /// Bind the listening socket; port 0 picks a free port
    pub async fn bind<A: ToSocketAddrs>(addr: A, router: Arc<QueryRouter>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            metrics: Arc::new(ServerMetrics::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// On shutdown every session is cancelled, which makes it send the
    /// administrator shutdown notice, and this call returns once all session
    /// tasks have finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        info!(addr = ?self.listener.local_addr().ok(), "proxy listening");

        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = socket.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }

            let session_id = self.metrics.on_connection();
            debug!(session_id, peer = %peer, "accepted connection");

            let session = WireSession::new(socket, Arc::clone(&self.router), shutdown.child_token())
                .with_id(session_id)
                .with_peer(peer);
            let metrics = Arc::clone(&self.metrics);
            tracker.spawn(async move {
                if session.run().await.is_err() {
                    metrics.on_session_failure();
                }
            });
        }

        info!(sessions = tracker.len(), "shutting down, waiting for sessions");
        drop(self.listener);
        tracker.close();
        tracker.wait().await;
        info!(
            accepted = self.metrics.connections_accepted(),
            failed = self.metrics.sessions_failed(),
            "all sessions closed"
        );
        Ok(())
    }
}
