//! Brokerless task dispatch for buildmesh.
//!
//! This crate lets a client hand build tasks to a fleet of workers without
//! any central broker:
//!
//! - Peer discovery through a shared brokerage directory
//! - Mutually authenticated, encrypted tunnels (secret handshake + box stream)
//! - A seven-kind message protocol with a per-tunnel message loop
//! - A client-side worker pool with atomic claim/release
//! - A worker that executes tasks and streams their events back
//!
//! # Architecture
//!
//! Every tunnel is owned by exactly one tokio task running a [`Session`].
//! Other components talk to it only through its inbox channel and observer
//! table.
//!
//! ```text
//! Client                                   Worker::run()
//! ├── Discovery Task ── brokerage dir ──── ├── Re-announce timer
//! ├── Worker Loop 1 ════ tunnel ══════════ ├── Connection Task 1
//! ├── Worker Loop 2 ════ tunnel ════╗      └── Connection Task 2
//! └── dispatch_task() -> TaskFuture ╚════════ (another worker)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use buildmesh_net::{Client, DispatchOptions, MeshConfig};
//!
//! let config = MeshConfig::new("/shared/brokerage".into());
//! let client = Client::new(config, app_key, local);
//! client.start().await?;
//!
//! let outcome = client
//!     .dispatch_task("cc", vec!["-c".into(), "main.c".into()], DispatchOptions::new())
//!     .await?;
//! ```

pub mod config;
pub mod error;

pub mod client;
pub mod exec;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod tunnel;
pub mod worker;

// Re-export main types
pub use client::{Client, DispatchOptions, TaskFuture, TaskOutcome, WorkerSnapshot};
pub use config::{MeshConfig, DEFAULT_PORT, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use error::{MeshError, MeshResult};
pub use exec::{ExecError, LocalProcess, TaskEvents, TaskExecutor};
pub use peer::{describe_local, DiscoveredPeer, LocalPeer, PeerFlags, PeerInfo, PeerMode};
pub use protocol::{AccessMode, Message, MessageKind, Session};
pub use registry::PeerRegistry;
pub use tunnel::Tunnel;
pub use worker::Worker;
