//! Message protocol layer.
//!
//! This module contains:
//! - Definitions of the seven tunnel message kinds and their wire encoding
//! - Per-kind observer tables
//! - The per-tunnel message loop

pub mod messages;
pub mod observers;
pub mod session;

// Re-export main types
pub use messages::{
    AccessMode, Message, MessageKind, Payload, TaskDispatch, TaskFileAccess, TaskOutput, TaskStop,
};
pub use observers::{Observer, ObserverTable};
pub use session::{Session, NO_EXECUTOR};
