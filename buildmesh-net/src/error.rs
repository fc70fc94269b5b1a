//! Mesh error types.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the registry, tunnels, message loops, client and worker.
#[derive(Debug, Error)]
pub enum MeshError {
    /// I/O error during network or filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a payload.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A key, signature or sealed box was rejected.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The brokerage directory does not exist.
    #[error("Brokerage directory not found: {}", .0.display())]
    BrokerageMissing(PathBuf),

    /// A brokerage entry could not be parsed.
    #[error("Invalid peer entry {name}: {reason}")]
    InvalidPeerEntry { name: String, reason: String },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake timed out.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// None of a peer's advertised addresses could be reached.
    #[error("No reachable address for peer {peer}")]
    Unreachable { peer: String },

    /// No traffic arrived from the remote side within the deadline.
    #[error("Tunnel to {addr} idle for {idle:?}")]
    IdleTimeout { addr: SocketAddr, idle: Duration },

    /// A read or write did not complete within its deadline.
    #[error("Deadline exceeded on tunnel to {addr}")]
    DeadlineExceeded { addr: SocketAddr },

    /// Peer disconnected.
    #[error("Peer disconnected: {reason}")]
    PeerDisconnected { reason: String },

    /// The tunnel was already closed.
    #[error("Tunnel closed")]
    TunnelClosed,

    /// Frame exceeds maximum allowed size.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A frame carried a message type this build does not know.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    /// A frame could not be decoded into a message.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No worker in the pool is free to take a task.
    #[error("No available worker")]
    NoCapacity,

    /// The remote process failed.
    #[error("Remote task on {addr} failed: {message}")]
    RemoteTask { addr: SocketAddr, message: String },

    /// The tunnel carrying a task went away before the task finished.
    #[error("Connection to {addr} lost while waiting for task")]
    ConnectionLost { addr: SocketAddr },

    /// The background task driving a dispatch panicked or was aborted.
    #[error("Dispatch aborted: {0}")]
    DispatchAborted(String),

    /// Work was cancelled by shutdown.
    #[error("Cancelled")]
    Cancelled,
}

impl MeshError {
    /// Whether this error only reflects a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeshError::Cancelled)
    }
}

impl From<buildmesh_core::SerializationError> for MeshError {
    fn from(err: buildmesh_core::SerializationError) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<buildmesh_core::CryptoError> for MeshError {
    fn from(err: buildmesh_core::CryptoError) -> Self {
        MeshError::Crypto(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
