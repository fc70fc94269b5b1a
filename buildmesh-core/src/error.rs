//! Error types for the buildmesh core crate.

use std::fmt;

/// Errors related to keys, signatures and sealed boxes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// The public key is malformed or not a valid curve point.
    InvalidPublicKey,
    /// The secret key is malformed.
    InvalidSecretKey,
    /// Signature verification failed (signature doesn't match message/key).
    SignatureVerificationFailed,
    /// A message authentication code did not match.
    MacMismatch,
    /// Text could not be decoded as a key.
    InvalidEncoding(String),
    /// Authenticated encryption failed.
    SealFailed,
    /// Authenticated decryption failed (wrong key, wrong nonce or tampered data).
    OpenFailed,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidPublicKey => write!(f, "invalid public key"),
            CryptoError::InvalidSecretKey => write!(f, "invalid secret key"),
            CryptoError::SignatureVerificationFailed => write!(f, "signature verification failed"),
            CryptoError::MacMismatch => write!(f, "message authentication code mismatch"),
            CryptoError::InvalidEncoding(msg) => write!(f, "invalid key encoding: {}", msg),
            CryptoError::SealFailed => write!(f, "failed to seal box"),
            CryptoError::OpenFailed => write!(f, "failed to open box"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Errors related to serialization and deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializationError {
    /// Failed to encode data to bytes.
    EncodeFailed(String),
    /// Failed to decode data from bytes.
    DecodeFailed(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::EncodeFailed(msg) => write!(f, "encode failed: {}", msg),
            SerializationError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for SerializationError {}
