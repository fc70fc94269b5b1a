//! Deterministic binary serialization for buildmesh wire payloads.
//!
//! Message bodies are serialized with bincode in a fixed configuration so
//! that both ends of a tunnel agree on the layout byte for byte:
//! - Fixed-width little-endian integers
//! - No trailing bytes accepted on decode

mod bincode_config;

pub use bincode_config::{deserialize, serialize, serialize_into};
