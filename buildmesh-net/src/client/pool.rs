//! Connected workers held by a client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildmesh_core::PublicKey;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{MeshError, MeshResult};
use crate::protocol::{Message, ObserverTable};
use crate::tunnel::LinkStats;

/// Client-side handle to one worker's message loop.
#[derive(Debug)]
pub struct RemoteWorker {
    public_key: PublicKey,
    addr: SocketAddr,
    host: String,
    available: AtomicBool,
    retired: AtomicBool,
    inbox: mpsc::Sender<Message>,
    observers: ObserverTable,
    stats: LinkStats,
}

impl RemoteWorker {
    /// Wrap the channels of a freshly spawned loop. The worker starts available.
    pub fn new(
        public_key: PublicKey,
        addr: SocketAddr,
        host: impl Into<String>,
        inbox: mpsc::Sender<Message>,
        observers: ObserverTable,
        stats: LinkStats,
    ) -> Self {
        Self {
            public_key,
            addr,
            host: host.into(),
            available: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            inbox,
            observers,
            stats,
        }
    }

    /// Worker identity.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Address the tunnel is connected to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Advertised hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Observer table of the worker's loop.
    pub fn observers(&self) -> &ObserverTable {
        &self.observers
    }

    /// Liveness data of the worker's tunnel.
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Whether no task is assigned and the tunnel is still up.
    pub fn is_available(&self) -> bool {
        !self.is_retired() && self.available.load(Ordering::Acquire)
    }

    /// Whether the tunnel has closed.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Atomically take the worker. Exactly one concurrent caller wins, and
    /// a retired worker is never taken.
    pub fn try_claim(&self) -> bool {
        if self.is_retired() {
            return false;
        }
        self.available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Hand the worker back after a task. No effect once retired.
    pub fn release(&self) {
        if !self.is_retired() {
            self.available.store(true, Ordering::Release);
        }
    }

    /// Take the worker out of rotation for good.
    pub fn mark_unavailable(&self) {
        self.retired.store(true, Ordering::Release);
        self.available.store(false, Ordering::Release);
    }

    /// Queue a message on the loop's inbox.
    pub async fn send(&self, message: Message) -> MeshResult<()> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| MeshError::ConnectionLost { addr: self.addr })
    }

    /// Queue a message if the inbox has room. Returns whether it was queued.
    pub fn try_send(&self, message: Message) -> bool {
        self.inbox.try_send(message).is_ok()
    }

    /// Resolves once the worker's loop has exited.
    pub async fn closed(&self) {
        self.inbox.closed().await
    }

    /// Whether the worker's loop has exited.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Point-in-time view for reporting.
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            public_key: self.public_key,
            addr: self.addr,
            host: self.host.clone(),
            available: self.is_available(),
            latency: self.stats.latency(),
            frames_recv: self.stats.frames_recv(),
        }
    }
}

/// Read-only view of one pooled worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Worker identity.
    pub public_key: PublicKey,
    /// Connected address.
    pub addr: SocketAddr,
    /// Advertised hostname.
    pub host: String,
    /// Whether no task is assigned.
    pub available: bool,
    /// Most recent latency sample.
    pub latency: Option<Duration>,
    /// Frames received over the tunnel so far.
    pub frames_recv: u64,
}

/// Workers keyed by identity; at most one entry per key.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Mutex<HashMap<PublicKey, Arc<RemoteWorker>>>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Returns false, leaving the pool unchanged, if its key is already present.
    pub fn insert(&self, worker: Arc<RemoteWorker>) -> bool {
        let mut workers = self.workers.lock();
        if workers.contains_key(worker.public_key()) {
            return false;
        }
        workers.insert(*worker.public_key(), worker);
        true
    }

    /// Remove the worker for `key`.
    pub fn remove(&self, key: &PublicKey) -> Option<Arc<RemoteWorker>> {
        self.workers.lock().remove(key)
    }

    /// Whether a worker for `key` is pooled.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.workers.lock().contains_key(key)
    }

    /// Number of pooled workers.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of workers with no task assigned.
    pub fn available(&self) -> usize {
        self.workers.lock().values().filter(|w| w.is_available()).count()
    }

    /// Claim any free worker.
    pub fn claim_any(&self) -> Option<Arc<RemoteWorker>> {
        self.workers
            .lock()
            .values()
            .find(|w| w.try_claim())
            .cloned()
    }

    /// Snapshot of every pooled worker.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut out: Vec<WorkerSnapshot> = self.workers.lock().values().map(|w| w.snapshot()).collect();
        out.sort_by(|a, b| a.host.cmp(&b.host).then(a.addr.cmp(&b.addr)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmesh_core::KeyPair;

    fn worker() -> (Arc<RemoteWorker>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(1);
        let worker = RemoteWorker::new(
            KeyPair::generate().public_key(),
            "127.0.0.1:4000".parse().unwrap(),
            "builder",
            tx,
            ObserverTable::new(),
            LinkStats::new(),
        );
        (Arc::new(worker), rx)
    }

    #[test]
    fn test_claim_and_release() {
        let (w, _rx) = worker();
        assert!(w.is_available());
        assert!(w.try_claim());
        assert!(!w.is_available());
        assert!(!w.try_claim());
        w.release();
        assert!(w.try_claim());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let (w, _rx) = worker();
        let winners: usize = (0..16)
            .map(|_| {
                let w = w.clone();
                std::thread::spawn(move || w.try_claim())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_pool_unique_keys() {
        let pool = WorkerPool::new();
        let (w, _rx) = worker();
        assert!(pool.insert(w.clone()));
        assert!(!pool.insert(w.clone()));
        assert_eq!(pool.len(), 1);

        assert!(pool.claim_any().is_some());
        assert!(pool.claim_any().is_none());
        assert_eq!(pool.available(), 0);

        pool.remove(w.public_key());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_retired_worker_stays_out_of_rotation() {
        let pool = WorkerPool::new();
        let (w, _rx) = worker();
        pool.insert(w.clone());

        assert!(w.try_claim());
        w.mark_unavailable();
        w.release();

        assert!(w.is_retired());
        assert!(!w.is_available());
        assert_eq!(pool.available(), 0);
        assert!(pool.claim_any().is_none());
        assert!(!w.snapshot().available);
    }

    #[tokio::test]
    async fn test_send_after_loop_exit() {
        let (w, rx) = worker();
        drop(rx);
        assert!(w.is_closed());
        assert!(matches!(
            w.send(Message::ping()).await,
            Err(MeshError::ConnectionLost { .. })
        ));
    }
}
