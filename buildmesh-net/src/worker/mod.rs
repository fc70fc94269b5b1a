//! The executing side.
//!
//! ```text
//! Worker::run()
//! ├── Listener (accept inbound)
//! ├── Re-announce timer
//! ├── Connection Task 1 (handshake + Session with executor)
//! └── Connection Task 2
//! ```
//!
//! Connection failures are logged and contained to their task.

use std::net::SocketAddr;
use std::sync::Arc;

use buildmesh_core::AppKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MeshConfig;
use crate::error::MeshResult;
use crate::exec::TaskExecutor;
use crate::peer::LocalPeer;
use crate::protocol::Session;
use crate::registry::PeerRegistry;
use crate::tunnel::Tunnel;

/// Accepts tunnels and runs dispatched tasks.
pub struct Worker {
    config: MeshConfig,
    app_key: AppKey,
    local: LocalPeer,
    registry: Arc<PeerRegistry>,
    executor: Option<Arc<dyn TaskExecutor>>,
    cancel: CancellationToken,
    bound_addr_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl Worker {
    /// Create a worker. Without an executor every task is refused.
    pub fn new(config: MeshConfig, app_key: AppKey, local: LocalPeer) -> Self {
        let registry = Arc::new(PeerRegistry::new(config.brokerage_dir.clone()));
        Self {
            config,
            app_key,
            local,
            registry,
            executor: None,
            cancel: CancellationToken::new(),
            bound_addr_tx: None,
        }
    }

    /// Run tasks with `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Get a oneshot receiver that will receive the bound address when the worker starts.
    pub fn bound_addr_receiver(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.bound_addr_tx = Some(tx);
        rx
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Listen, announce and serve until shut down.
    ///
    /// The listener binds `config.bind_ip` on the port of the local
    /// advertisement; port 0 is replaced by the one the OS picked before
    /// the first announce.
    ///
    /// On shutdown the worker stops accepting, waits for open connections
    /// to close and removes its brokerage entry.
    pub async fn run(mut self) -> MeshResult<()> {
        let bind_addr = SocketAddr::new(self.config.bind_ip, self.local.info.flags.port);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local.info.flags.port = local_addr.port();
        let key = self.local.public_key();

        self.registry.announce(&key, &self.local.info).await?;
        tracing::info!(addr = %local_addr, peer = %key, mode = %self.local.info.flags.mode, "Worker listening");

        if let Some(tx) = self.bound_addr_tx.take() {
            let _ = tx.send(local_addr);
        }

        let period = self.config.announce_interval;
        let mut announce_timer = interval_at(Instant::now() + period, period);
        announce_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::info!("Worker shutting down");
                    break;
                }

                _ = announce_timer.tick() => {
                    if let Err(e) = self.registry.announce(&key, &self.local.info).await {
                        tracing::warn!(error = %e, "Re-announce failed");
                    }
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!(addr = %addr, "Accepted inbound");
                            connections.spawn(serve_connection(
                                stream,
                                addr,
                                self.app_key.clone(),
                                self.local.clone(),
                                self.config.clone(),
                                self.executor.clone(),
                                self.cancel.child_token(),
                            ));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept error");
                        }
                    }
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "Connection task panicked");
                    }
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}

        self.registry.disappear(&key).await?;
        tracing::info!(peer = %key, "Worker stopped");
        Ok(())
    }
}

/// Handshake and serve one inbound connection.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    app_key: AppKey,
    local: LocalPeer,
    config: MeshConfig,
    executor: Option<Arc<dyn TaskExecutor>>,
    cancel: CancellationToken,
) {
    let handshake = Tunnel::accept(stream, addr, &app_key, &local.identity, &config);
    let tunnel = tokio::select! {
        _ = cancel.cancelled() => return,
        result = handshake => match result {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::warn!(addr = %addr, error = %e, "Inbound handshake failed");
                return;
            }
        },
    };
    tracing::info!(peer = %tunnel.remote_key(), addr = %addr, "Client connected");

    let mut session = Session::new(tunnel, cancel);
    if let Some(executor) = executor {
        session = session.with_executor(executor);
    }
    // Errors are logged by the session itself.
    let _ = session.run().await;
}
