//! Peer registry backed by the brokerage directory.
//!
//! The registry is eventually consistent: a peer becomes visible to others
//! on their next [`PeerRegistry::discover`] after it announces, and vanishes
//! on the pass after it disappears. There is no locking across machines;
//! the rename in [`Brokerage::write_entry`] is the only atomicity relied on.

mod brokerage;

use std::path::{Path, PathBuf};

use buildmesh_core::PublicKey;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::error::MeshResult;
use crate::peer::{DiscoveredPeer, PeerInfo};

pub use brokerage::Brokerage;

struct RegistryState {
    brokerage: Brokerage,
    peers: Vec<DiscoveredPeer>,
}

/// Directory of live peers.
pub struct PeerRegistry {
    state: RwLock<RegistryState>,
    dir: PathBuf,
}

impl PeerRegistry {
    /// Create a registry over `brokerage_dir`.
    pub fn new(brokerage_dir: impl Into<PathBuf>) -> Self {
        let dir = brokerage_dir.into();
        Self {
            state: RwLock::new(RegistryState {
                brokerage: Brokerage::new(dir.clone()),
                peers: Vec::new(),
            }),
            dir,
        }
    }

    /// Brokerage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish `info` under `key`, replacing any previous entry.
    pub async fn announce(&self, key: &PublicKey, info: &PeerInfo) -> MeshResult<()> {
        let state = self.state.write().await;
        state.brokerage.write_entry(key, info).await?;
        tracing::debug!(peer = %key, port = info.flags.port, "Announced");
        Ok(())
    }

    /// Remove the entry for `key`.
    pub async fn disappear(&self, key: &PublicKey) -> MeshResult<()> {
        let state = self.state.write().await;
        state.brokerage.remove_entry(key).await?;
        tracing::debug!(peer = %key, "Disappeared");
        Ok(())
    }

    /// Replace the in-memory list with the current brokerage contents.
    ///
    /// Returns the number of valid peers found. On error the list is left empty.
    pub async fn discover(&self) -> MeshResult<usize> {
        let mut state = self.state.write().await;
        state.peers.clear();

        let peers = state.brokerage.scan().await?;
        state.peers = peers;

        tracing::debug!(count = state.peers.len(), dir = ?self.dir, "Discovered peers");
        Ok(state.peers.len())
    }

    /// A uniformly random peer from the latest discovery pass.
    pub async fn random_peer(&self) -> Option<DiscoveredPeer> {
        let state = self.state.read().await;
        state.peers.choose(&mut OsRng).cloned()
    }

    /// Snapshot of the latest discovery pass.
    pub async fn peers(&self) -> Vec<DiscoveredPeer> {
        self.state.read().await.peers.clone()
    }

    /// Number of peers in the latest discovery pass.
    pub async fn len(&self) -> usize {
        self.state.read().await.peers.len()
    }

    /// Whether the latest discovery pass found nothing.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use crate::peer::PeerFlags;
    use buildmesh_core::KeyPair;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn info(n: usize) -> PeerInfo {
        PeerInfo::new(
            format!("host-{}", n),
            vec!["10.0.0.1".parse().unwrap()],
            PeerFlags::default(),
        )
    }

    #[tokio::test]
    async fn test_discover_counts_announced() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::new(dir.path());

        let keys: Vec<PublicKey> = (0..5).map(|_| KeyPair::generate().public_key()).collect();
        for (n, key) in keys.iter().enumerate() {
            registry.announce(key, &info(n)).await.unwrap();
        }

        assert_eq!(registry.discover().await.unwrap(), 5);
        assert_eq!(registry.len().await, 5);

        let members: HashSet<PublicKey> = keys.into_iter().collect();
        for _ in 0..20 {
            let peer = registry.random_peer().await.unwrap();
            assert!(members.contains(&peer.public_key));
        }
    }

    #[tokio::test]
    async fn test_disappear_excludes_peer() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::new(dir.path());
        let stays = KeyPair::generate().public_key();
        let leaves = KeyPair::generate().public_key();

        registry.announce(&stays, &info(0)).await.unwrap();
        registry.announce(&leaves, &info(1)).await.unwrap();
        assert_eq!(registry.discover().await.unwrap(), 2);

        registry.disappear(&leaves).await.unwrap();
        assert_eq!(registry.discover().await.unwrap(), 1);
        let peers = registry.peers().await;
        assert_eq!(peers[0].public_key, stays);
    }

    #[tokio::test]
    async fn test_announce_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = PeerRegistry::new(dir.path());
        let key = KeyPair::generate().public_key();

        registry.announce(&key, &info(0)).await.unwrap();
        registry.announce(&key, &info(1)).await.unwrap();

        assert_eq!(registry.discover().await.unwrap(), 1);
        assert_eq!(registry.peers().await[0].info.host, "host-1");
    }

    #[tokio::test]
    async fn test_missing_brokerage_clears_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("brokerage");
        let registry = PeerRegistry::new(&path);
        registry
            .announce(&KeyPair::generate().public_key(), &info(0))
            .await
            .unwrap();
        assert_eq!(registry.discover().await.unwrap(), 1);

        std::fs::remove_dir_all(&path).unwrap();
        assert!(matches!(
            registry.discover().await,
            Err(MeshError::BrokerageMissing(_))
        ));
        assert!(registry.is_empty().await);
        assert!(registry.random_peer().await.is_none());
    }
}
