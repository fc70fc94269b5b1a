//! On-disk layout of the brokerage directory.
//!
//! One JSON file per peer, named by the URL-safe base64 of its public key.
//! Writes land in a dot-prefixed temporary file first and are renamed into
//! place, so readers on other machines never observe a partial entry.

use std::io;
use std::path::{Path, PathBuf};

use buildmesh_core::PublicKey;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{MeshError, MeshResult};
use crate::peer::{DiscoveredPeer, PeerInfo};

/// A shared directory holding one advertisement per peer.
#[derive(Debug, Clone)]
pub struct Brokerage {
    dir: PathBuf,
}

impl Brokerage {
    /// Wrap a brokerage directory. Nothing is touched on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the entry for `key`.
    pub fn entry_path(&self, key: &PublicKey) -> PathBuf {
        self.dir.join(key.to_base64())
    }

    /// Write (or overwrite) the entry for `key`, creating the directory if needed.
    pub async fn write_entry(&self, key: &PublicKey, info: &PeerInfo) -> MeshResult<()> {
        fs::create_dir_all(&self.dir).await?;

        let name = key.to_base64();
        let contents = serde_json::to_vec_pretty(info)?;
        let temp_path = self
            .dir
            .join(format!(".{}.{}.tmp", name, std::process::id()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, self.dir.join(&name)).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the entry for `key`. A missing entry is not an error.
    pub async fn remove_entry(&self, key: &PublicKey) -> MeshResult<()> {
        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every well-formed entry.
    ///
    /// Fails only when the directory itself cannot be listed. Entries whose
    /// name or contents do not parse are logged and skipped.
    pub async fn scan(&self) -> MeshResult<Vec<DiscoveredPeer>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MeshError::BrokerageMissing(self.dir.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut peers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match read_entry(&entry.path(), &name).await {
                Ok(peer) => peers.push(peer),
                Err(e) => tracing::warn!(entry = %name, error = %e, "Skipping brokerage entry"),
            }
        }
        Ok(peers)
    }
}

async fn read_entry(path: &Path, name: &str) -> MeshResult<DiscoveredPeer> {
    let invalid = |reason: String| MeshError::InvalidPeerEntry {
        name: name.to_string(),
        reason,
    };

    let public_key = PublicKey::from_base64(name).map_err(|e| invalid(e.to_string()))?;
    let contents = fs::read(path).await?;
    let info: PeerInfo =
        serde_json::from_slice(&contents).map_err(|e| invalid(e.to_string()))?;

    Ok(DiscoveredPeer { public_key, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerFlags;
    use buildmesh_core::KeyPair;
    use tempfile::tempdir;

    fn info(host: &str) -> PeerInfo {
        PeerInfo::new(host, vec!["10.0.0.1".parse().unwrap()], PeerFlags::default())
    }

    #[tokio::test]
    async fn test_write_creates_directory() {
        let dir = tempdir().unwrap();
        let brokerage = Brokerage::new(dir.path().join("nested").join("brokerage"));
        let key = KeyPair::generate().public_key();

        brokerage.write_entry(&key, &info("a")).await.unwrap();

        let text = std::fs::read_to_string(brokerage.entry_path(&key)).unwrap();
        let parsed: PeerInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.host, "a");
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let brokerage = Brokerage::new(dir.path());
        let key = KeyPair::generate().public_key();

        brokerage.write_entry(&key, &info("first")).await.unwrap();
        brokerage.write_entry(&key, &info("second")).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);

        let peers = brokerage.scan().await.unwrap();
        assert_eq!(peers[0].info.host, "second");
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let brokerage = Brokerage::new(dir.path());
        let key = KeyPair::generate().public_key();
        brokerage.remove_entry(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_skips_malformed() {
        let dir = tempdir().unwrap();
        let brokerage = Brokerage::new(dir.path());
        let key = KeyPair::generate().public_key();
        brokerage.write_entry(&key, &info("good")).await.unwrap();

        std::fs::write(dir.path().join("not-a-key"), b"{}").unwrap();
        let other = KeyPair::generate().public_key();
        std::fs::write(brokerage.entry_path(&other), b"not json").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"ignored").unwrap();

        let peers = brokerage.scan().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, key);
    }

    #[tokio::test]
    async fn test_scan_missing_directory() {
        let dir = tempdir().unwrap();
        let brokerage = Brokerage::new(dir.path().join("absent"));
        assert!(matches!(
            brokerage.scan().await,
            Err(MeshError::BrokerageMissing(_))
        ));
    }
}
