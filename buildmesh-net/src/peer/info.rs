//! Peer advertisements.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use buildmesh_core::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_PORT, PROTOCOL_VERSION};

/// How a peer wants to be used by dispatching clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMode {
    /// Never accepts work; clients skip it.
    Disabled,
    /// Accepts work when the machine is otherwise idle.
    Idle,
    /// Dedicated build machine.
    #[default]
    Dedicated,
}

impl PeerMode {
    /// Whether clients may dial a peer in this mode.
    pub fn accepts_work(self) -> bool {
        !matches!(self, PeerMode::Disabled)
    }
}

impl fmt::Display for PeerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMode::Disabled => write!(f, "disabled"),
            PeerMode::Idle => write!(f, "idle"),
            PeerMode::Dedicated => write!(f, "dedicated"),
        }
    }
}

impl std::str::FromStr for PeerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(PeerMode::Disabled),
            "idle" => Ok(PeerMode::Idle),
            "dedicated" => Ok(PeerMode::Dedicated),
            other => Err(format!("unknown peer mode: {}", other)),
        }
    }
}

/// Capabilities a peer advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerFlags {
    /// Usage mode.
    pub mode: PeerMode,
    /// Maximum number of threads a dispatched task may use (0 = all).
    pub max_threads: u32,
    /// Free memory, in bytes, the peer keeps in reserve.
    pub min_free_memory: u64,
    /// Port the worker listens on.
    pub port: u16,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            mode: PeerMode::default(),
            max_threads: 0,
            min_free_memory: 0,
            port: DEFAULT_PORT,
        }
    }
}

/// Hardware survey of a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    /// CPU architecture (`x86_64`, `aarch64`, ...).
    pub arch: String,
    /// Operating system family.
    pub family: String,
    /// CPU vendor string.
    pub vendor: String,
    /// Physical cores.
    pub cores: u32,
    /// Hardware threads.
    pub threads: u32,
    /// Maximum clock in MHz.
    pub max_clock: u64,
    /// Last-level cache size in bytes.
    pub cache_size: u64,
    /// Total memory in bytes.
    pub virtual_memory: u64,
}

/// Everything a peer publishes about itself in the brokerage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Protocol version tag.
    pub version: String,
    /// Non-loopback addresses the peer is reachable on.
    pub ips: Vec<IpAddr>,
    /// Hostname.
    pub host: String,
    /// Reverse-DNS domain, empty when unknown.
    #[serde(default)]
    pub domain: String,
    /// Hardware survey.
    #[serde(default)]
    pub hardware: HardwareInfo,
    /// Capability flags.
    pub flags: PeerFlags,
}

impl PeerInfo {
    /// Create an advertisement with the current protocol version and no hardware data.
    pub fn new(host: impl Into<String>, ips: Vec<IpAddr>, flags: PeerFlags) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            ips,
            host: host.into(),
            domain: String::new(),
            hardware: HardwareInfo::default(),
            flags,
        }
    }

    /// Socket addresses built from the advertised IPs and listen port.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.ips
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.flags.port))
            .collect()
    }

    /// Fully qualified name when a domain is known.
    pub fn fqdn(&self) -> String {
        if self.domain.is_empty() {
            self.host.clone()
        } else {
            format!("{}.{}", self.host, self.domain)
        }
    }
}

/// A peer found in the brokerage during the latest discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Key the entry was filed under.
    pub public_key: PublicKey,
    /// Parsed advertisement.
    pub info: PeerInfo,
}

impl DiscoveredPeer {
    /// Socket addresses to try when dialing this peer.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.info.socket_addrs()
    }
}

impl fmt::Display for DiscoveredPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.public_key, self.info.fqdn())
    }
}

/// This process: its identity and what it advertises.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    /// Identity key pair.
    pub identity: Arc<KeyPair>,
    /// Advertisement written to the brokerage.
    pub info: PeerInfo,
}

impl LocalPeer {
    /// Bundle an identity with its advertisement.
    pub fn new(identity: KeyPair, info: PeerInfo) -> Self {
        Self {
            identity: Arc::new(identity),
            info,
        }
    }

    /// Public key naming this process.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }
}
