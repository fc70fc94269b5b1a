//! # buildmesh core
//!
//! Identity, cryptography and serialization shared by every buildmesh crate:
//! - Ed25519 peer identities with filename-safe text encoding
//! - The deployment-wide application key
//! - SHA-256, HMAC-SHA-256, X25519 agreement and AES-256-GCM boxes
//! - Deterministic binary serialization for wire payloads

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod error;
pub mod serialization;

pub use crypto::{AppKey, EphemeralKey, KeyPair, PublicKey, SecretKey, Signature};
pub use error::{CryptoError, SerializationError};
