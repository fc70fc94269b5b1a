//! Mesh configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::peer::PeerFlags;

/// Version tag written into every peer advertisement.
pub const PROTOCOL_VERSION: &str = "buildmesh/1";

/// Maximum plaintext size of one tunnel frame (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default port workers listen on.
pub const DEFAULT_PORT: u16 = 21337;

/// Default heartbeat interval and read/write deadline.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A message loop gives up after this many idle periods without inbound traffic.
pub const IDLE_DEADLINE_FACTOR: u32 = 3;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default client re-discovery interval.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Default worker re-announce interval.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Default maximum number of workers held by a client.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Configuration shared by clients and workers.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Shared directory used as the peer rendezvous.
    pub brokerage_dir: PathBuf,

    /// Address the worker listener binds to (the port comes from `flags`).
    pub bind_ip: IpAddr,

    /// Heartbeat interval; also the per-frame read/write deadline.
    pub idle_timeout: Duration,

    /// Timeout for establishing outbound TCP connections.
    pub connect_timeout: Duration,

    /// Timeout for completing the secure handshake.
    pub handshake_timeout: Duration,

    /// Interval between client discovery passes.
    pub discovery_interval: Duration,

    /// Interval between worker re-announcements.
    pub announce_interval: Duration,

    /// Maximum number of connected workers a client keeps.
    pub max_workers: usize,

    /// Capabilities advertised by this peer.
    pub flags: PeerFlags,

    /// Addresses to advertise instead of the detected ones.
    pub advertise_ips: Vec<IpAddr>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            brokerage_dir: std::env::temp_dir().join("buildmesh").join("brokerage"),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            max_workers: DEFAULT_MAX_WORKERS,
            flags: PeerFlags::default(),
            advertise_ips: Vec::new(),
        }
    }
}

impl MeshConfig {
    /// Create a new configuration rooted at the given brokerage directory.
    pub fn new(brokerage_dir: PathBuf) -> Self {
        Self {
            brokerage_dir,
            ..Default::default()
        }
    }

    /// Set the address the listener binds to.
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Set the listen port advertised in the peer flags.
    pub fn with_port(mut self, port: u16) -> Self {
        self.flags.port = port;
        self
    }

    /// Set the heartbeat interval / frame deadline.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the client re-discovery interval.
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Set the worker re-announce interval.
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the maximum pool size.
    pub fn with_max_workers(mut self, count: usize) -> Self {
        self.max_workers = count;
        self
    }

    /// Replace the advertised capability flags.
    pub fn with_flags(mut self, flags: PeerFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Advertise these addresses instead of the detected ones.
    pub fn with_advertise_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.advertise_ips = ips;
        self
    }

    /// Time without inbound traffic after which a message loop fails.
    pub fn idle_deadline(&self) -> Duration {
        self.idle_timeout * IDLE_DEADLINE_FACTOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerMode;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.flags.port, DEFAULT_PORT);
        assert_eq!(config.idle_deadline(), DEFAULT_IDLE_TIMEOUT * 3);
    }

    #[test]
    fn test_config_builder() {
        let config = MeshConfig::new(PathBuf::from("/shared/brokerage"))
            .with_port(0)
            .with_max_workers(2)
            .with_idle_timeout(Duration::from_millis(200))
            .with_flags(PeerFlags {
                mode: PeerMode::Idle,
                ..PeerFlags::default()
            });

        assert_eq!(config.brokerage_dir, PathBuf::from("/shared/brokerage"));
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.idle_timeout, Duration::from_millis(200));
        assert_eq!(config.flags.mode, PeerMode::Idle);
        // with_flags replaces the whole set, including the port.
        assert_eq!(config.flags.port, DEFAULT_PORT);
    }
}
