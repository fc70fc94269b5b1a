//! Ed25519 signature creation and verification.

use ed25519_dalek::Signer;

use super::keys::{PublicKey, SecretKey};
use crate::error::CryptoError;

/// Length of an encoded signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 signature wrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub ed25519_dalek::Signature);

impl Signature {
    /// Create a Signature from raw bytes.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LENGTH]) -> Self {
        Signature(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Create a Signature from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Get the raw bytes of the signature.
    #[inline]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0.to_bytes()
    }
}

/// Sign a message with a secret key.
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Signature {
    Signature(secret_key.sign(message))
}

/// Verify a signature against a message and public key.
///
/// Uses strict verification so that malleable encodings are rejected.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    public_key
        .inner()
        .verify_strict(message, &signature.0)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}
