//! Cryptographic primitives for buildmesh.
//!
//! This module provides:
//! - Ed25519 peer identities, signing and verification
//! - The shared application key
//! - SHA-256 and HMAC-SHA-256
//! - AES-256-GCM sealed boxes
//! - Ephemeral X25519 key agreement

mod app_key;
mod exchange;
mod hashing;
mod keys;
pub mod sealing;
mod signing;

pub use app_key::{AppKey, APP_KEY_LENGTH};
pub use exchange::EphemeralKey;
pub use hashing::{hmac_sha256, hmac_sha256_verify, sha256, sha256_concat};
pub use keys::{KeyPair, PublicKey, SecretKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
pub use signing::{sign, verify, Signature, SIGNATURE_LENGTH};
