//! Peer identities and advertisements.

pub mod hardware;
pub mod host;
mod info;

pub use host::describe_local;
pub use info::{DiscoveredPeer, HardwareInfo, LocalPeer, PeerFlags, PeerInfo, PeerMode};
