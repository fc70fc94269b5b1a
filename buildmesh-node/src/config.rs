//! Node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use buildmesh_core::{AppKey, KeyPair};
use buildmesh_net::{MeshConfig, PeerFlags};

use crate::cli::{expand_home, Cli, WorkerArgs};

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Shared brokerage directory.
    pub brokerage_dir: PathBuf,

    /// Application key file.
    pub app_key_file: PathBuf,

    /// Identity file.
    pub identity_file: PathBuf,

    /// Log level.
    pub log_level: String,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            brokerage_dir: expand_home(&cli.brokerage),
            app_key_file: expand_home(&cli.app_key_file),
            identity_file: expand_home(&cli.identity_file),
            log_level: cli.log_level.clone(),
        }
    }

    /// Mesh configuration for a dispatching client.
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig::new(self.brokerage_dir.clone())
    }

    /// Mesh configuration for a worker started with `args`.
    pub fn worker_config(&self, args: &WorkerArgs) -> MeshConfig {
        let flags = PeerFlags {
            mode: args.mode,
            max_threads: args.max_threads,
            min_free_memory: args.min_free_memory,
            port: args.port,
        };
        MeshConfig::new(self.brokerage_dir.clone())
            .with_bind_ip(args.bind)
            .with_flags(flags)
            .with_advertise_ips(args.advertise_ip.clone().unwrap_or_default())
            .with_announce_interval(Duration::from_secs(args.announce_interval.max(1)))
    }

    /// Read the application key. It must exist.
    pub fn load_app_key(&self) -> anyhow::Result<AppKey> {
        read_app_key(&self.app_key_file)
    }

    /// Read the identity, or generate one for this run if the file is absent.
    pub fn load_identity(&self) -> anyhow::Result<KeyPair> {
        read_identity(&self.identity_file)
    }
}

fn read_app_key(path: &Path) -> anyhow::Result<AppKey> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading application key {}", path.display()))?;
    AppKey::from_base64(&text).with_context(|| format!("parsing application key {}", path.display()))
}

fn read_identity(path: &Path) -> anyhow::Result<KeyPair> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            KeyPair::from_base64(&text).with_context(|| format!("parsing identity {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = KeyPair::generate();
            tracing::warn!(
                path = %path.display(),
                peer = %identity.public_key(),
                "No identity file, using an ephemeral identity"
            );
            Ok(identity)
        }
        Err(e) => Err(e).with_context(|| format!("reading identity {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Command;
    use clap::Parser;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> NodeConfig {
        NodeConfig {
            brokerage_dir: dir.join("brokerage"),
            app_key_file: dir.join("app.key"),
            identity_file: dir.join("identity.key"),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_worker_config_from_args() {
        let cli = Cli::parse_from([
            "buildmesh-node",
            "--brokerage",
            "/b",
            "worker",
            "--port",
            "0",
            "--mode",
            "idle",
            "--advertise-ip",
            "10.1.2.3",
        ]);
        let node = NodeConfig::from_cli(&cli);
        let Command::Worker(args) = &cli.command else {
            panic!("expected worker command");
        };

        let mesh = node.worker_config(args);
        assert_eq!(mesh.brokerage_dir, PathBuf::from("/b"));
        assert_eq!(mesh.flags.port, 0);
        assert_eq!(mesh.flags.mode, buildmesh_net::PeerMode::Idle);
        assert_eq!(mesh.advertise_ips, vec!["10.1.2.3".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[test]
    fn test_keys_round_trip_through_files() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let app_key = AppKey::generate();
        let identity = KeyPair::generate();
        std::fs::write(&config.app_key_file, app_key.to_base64()).unwrap();
        std::fs::write(&config.identity_file, format!("{}\n", identity.to_base64())).unwrap();

        assert_eq!(config.load_app_key().unwrap(), app_key);
        assert_eq!(config.load_identity().unwrap().public_key(), identity.public_key());
    }

    #[test]
    fn test_missing_app_key_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(config_in(dir.path()).load_app_key().is_err());
    }

    #[test]
    fn test_missing_identity_is_ephemeral() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let first = config.load_identity().unwrap();
        let second = config.load_identity().unwrap();
        assert_ne!(first.public_key(), second.public_key());
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.identity_file, "not a key").unwrap();
        assert!(config.load_identity().is_err());
    }
}
