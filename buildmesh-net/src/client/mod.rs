//! The dispatching side.
//!
//! A [`Client`] keeps a pool of connected workers, one message loop each,
//! and hands tasks to whichever worker is free:
//!
//! ```text
//! Client::start()
//! ├── discovery pass (registry -> dial -> handshake -> pool insert)
//! ├── Re-discovery Task (every discovery_interval)
//! ├── Worker Loop 1 (Session, inbox + observers)
//! ├── Worker Loop 2
//! └── Dispatch Task per in-flight dispatch_task()
//! ```

mod dispatch;
mod pool;

use std::sync::Arc;

use buildmesh_core::AppKey;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::peer::{DiscoveredPeer, LocalPeer};
use crate::protocol::{ObserverTable, Session, TaskDispatch};
use crate::registry::PeerRegistry;
use crate::tunnel::Tunnel;

pub use dispatch::{DispatchOptions, TaskFuture, TaskOutcome};
pub use pool::{RemoteWorker, WorkerPool, WorkerSnapshot};

struct ClientInner {
    config: MeshConfig,
    app_key: AppKey,
    local: LocalPeer,
    registry: PeerRegistry,
    pool: WorkerPool,
    loops: Mutex<JoinSet<MeshResult<()>>>,
    /// Serializes discovery passes so a peer is never dialed twice at once.
    discovering: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Discovers workers and dispatches tasks to them.
pub struct Client {
    inner: Arc<ClientInner>,
    discovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Create a client. Nothing happens until [`Client::start`] or
    /// [`Client::discover_workers`].
    pub fn new(config: MeshConfig, app_key: AppKey, local: LocalPeer) -> Self {
        let registry = PeerRegistry::new(config.brokerage_dir.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                app_key,
                local,
                registry,
                pool: WorkerPool::new(),
                loops: Mutex::new(JoinSet::new()),
                discovering: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
            discovery_task: Mutex::new(None),
        }
    }

    /// Run one discovery pass and schedule periodic re-discovery.
    ///
    /// Returns the result of the first pass; re-discovery is scheduled even
    /// when it fails, so a brokerage that appears later is still picked up.
    pub async fn start(&self) -> MeshResult<usize> {
        let first = self.discover_workers().await;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let period = inner.config.discovery_interval;
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(e) = inner.discover_workers().await {
                            tracing::warn!(error = %e, "Discovery pass failed");
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.discovery_task.lock().replace(handle) {
            previous.abort();
        }

        first
    }

    /// Refresh the registry and connect to peers not yet pooled.
    ///
    /// Returns the number of workers added.
    pub async fn discover_workers(&self) -> MeshResult<usize> {
        self.inner.discover_workers().await
    }

    /// Send a task to a free worker.
    ///
    /// When no worker is free the returned future is already resolved with
    /// [`MeshError::NoCapacity`].
    pub fn dispatch_task(
        &self,
        executable: impl Into<String>,
        arguments: Vec<String>,
        mut options: DispatchOptions,
    ) -> TaskFuture {
        if self.inner.cancel.is_cancelled() {
            return TaskFuture::ready(Err(MeshError::Cancelled));
        }
        let worker = match self.inner.pool.claim_any() {
            Some(worker) => worker,
            None => return TaskFuture::ready(Err(MeshError::NoCapacity)),
        };

        let task = TaskDispatch {
            executable: executable.into(),
            arguments,
            working_dir: std::mem::take(&mut options.working_dir),
            environment: std::mem::take(&mut options.environment),
        };
        let idle = self.inner.config.idle_timeout;
        TaskFuture::running(tokio::spawn(dispatch::run_dispatch(worker, task, options, idle)))
    }

    /// Snapshot of the pool.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.inner.pool.snapshot()
    }

    /// Number of workers with no task assigned.
    pub fn available_workers(&self) -> usize {
        self.inner.pool.available()
    }

    /// The peer registry this client discovers through.
    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    /// This process.
    pub fn local(&self) -> &LocalPeer {
        &self.inner.local
    }

    /// Stop discovery, close every tunnel and wait for every loop.
    ///
    /// Returns the first error a worker loop ended with while being torn
    /// down. Loops that had already finished are only logged.
    pub async fn close(&self) -> MeshResult<()> {
        self.inner.reap_loops();
        self.inner.cancel.cancel();

        let discovery = self.discovery_task.lock().take();
        if let Some(handle) = discovery {
            let _ = handle.await;
        }
        // Wait out a pass started by a direct discover_workers() call.
        let _pass = self.inner.discovering.lock().await;

        let mut loops = std::mem::take(&mut *self.inner.loops.lock());
        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            let result = joined.map_err(|e| MeshError::DispatchAborted(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        tracing::info!("Client closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ClientInner {
    async fn discover_workers(self: &Arc<Self>) -> MeshResult<usize> {
        let _pass = self.discovering.lock().await;
        if self.cancel.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        self.reap_loops();

        let found = self.registry.discover().await?;
        let local_key = self.local.public_key();

        let mut candidates: Vec<DiscoveredPeer> = self
            .registry
            .peers()
            .await
            .into_iter()
            .filter(|peer| peer.public_key != local_key)
            .filter(|peer| peer.info.flags.mode.accepts_work())
            .filter(|peer| !self.pool.contains(&peer.public_key))
            .collect();

        let room = self.config.max_workers.saturating_sub(self.pool.len());
        candidates.shuffle(&mut OsRng);
        candidates.truncate(room);

        tracing::debug!(found, dialing = candidates.len(), room, "Discovery pass");

        let dials = candidates.into_iter().map(|peer| {
            let inner = self.clone();
            async move {
                match inner.dial(&peer).await {
                    Ok(tunnel) => inner.adopt(peer, tunnel),
                    Err(e) => {
                        tracing::warn!(peer = %peer.public_key, host = %peer.info.host, error = %e, "Dial failed");
                        false
                    }
                }
            }
        });
        let added = join_all(dials).await.into_iter().filter(|added| *added).count();

        if added > 0 {
            tracing::info!(added, pool = self.pool.len(), "Connected to workers");
        }
        Ok(added)
    }

    /// Collect loops that have already ended. Their results were logged by
    /// the loop itself, so they are dropped here.
    fn reap_loops(&self) {
        let mut loops = self.loops.lock();
        while let Some(joined) = loops.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Reaped worker loop"),
                Err(e) => tracing::warn!(error = %e, "Worker loop panicked"),
            }
        }
    }

        /// Try each advertised address in turn.
    async fn dial(&self, peer: &DiscoveredPeer) -> MeshResult<Tunnel> {
        let mut last_error = None;
        for addr in peer.socket_addrs() {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => return Err(MeshError::Cancelled),
                attempt = Tunnel::connect(
                    addr,
                    &self.app_key,
                    &self.local.identity,
                    &peer.public_key,
                    &self.config,
                ) => attempt,
            };
            match attempt {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => {
                    tracing::debug!(peer = %peer.public_key, addr = %addr, error = %e, "Address unreachable");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| MeshError::Unreachable {
            peer: peer.public_key.to_base64(),
        }))
    }

    /// Pool the worker and start its loop. Returns false if it was not added.
    fn adopt(self: &Arc<Self>, peer: DiscoveredPeer, mut tunnel: Tunnel) -> bool {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let observers = ObserverTable::new();
        let worker = Arc::new(RemoteWorker::new(
            peer.public_key,
            tunnel.remote_addr(),
            peer.info.host.clone(),
            inbox_tx,
            observers.clone(),
            tunnel.stats(),
        ));

        let watched = worker.clone();
        tunnel.set_close_observer(move |_| watched.mark_unavailable());

        let mut loops = self.loops.lock();
        if self.cancel.is_cancelled() || !self.pool.insert(worker) {
            return false;
        }

        let session = Session::new(tunnel, self.cancel.child_token())
            .with_inbox(inbox_rx)
            .with_observers(observers);
        let inner = self.clone();
        let key = peer.public_key;
        loops.spawn(async move {
            let result = session.run().await;
            inner.pool.remove(&key);
            result
        });
        true
    }
}
