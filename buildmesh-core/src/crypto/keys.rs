//! Ed25519 peer identities.
//!
//! A peer is named by its Ed25519 public key. The textual form of the key
//! (URL-safe base64, no padding) doubles as the peer's filename inside the
//! brokerage directory, so it must survive a round trip through a filesystem.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CryptoError;

/// Length of an encoded public key in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of the expanded secret key (seed followed by public key).
pub const SECRET_KEY_LENGTH: usize = 64;

/// Type alias for Ed25519 secret/signing key.
pub type SecretKey = SigningKey;

/// Ed25519 public key naming one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub VerifyingKey);

impl PublicKey {
    /// Create a PublicKey from raw bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Create a PublicKey from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Parse the URL-safe base64 form produced by [`PublicKey::to_base64`].
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(CryptoError::InvalidEncoding(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LENGTH,
                bytes.len()
            )));
        }
        Self::from_slice(&bytes)
    }

    /// URL-safe base64 text, usable as a filename.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.as_bytes())
    }

    /// Get the raw bytes of the public key.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Get the inner VerifyingKey.
    #[inline]
    pub fn inner(&self) -> &VerifyingKey {
        &self.0
    }

    /// The birationally equivalent X25519 public key, used for key agreement.
    pub fn to_x25519(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0.to_montgomery().to_bytes())
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        PublicKey(key)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        PublicKey::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// Ed25519 key pair for a peer identity.
///
/// The secret half never leaves the process: it is only used to sign
/// handshake transcripts and to derive the X25519 static secret.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair using the OS random number generator.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair { signing_key }
    }

    /// Create a key pair from a 32-byte secret seed.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        KeyPair {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Create a key pair from the 64-byte expanded form (seed then public key).
    ///
    /// Fails if the trailing public key does not belong to the seed.
    pub fn from_keypair_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Result<Self, CryptoError> {
        SigningKey::from_keypair_bytes(bytes)
            .map(|signing_key| KeyPair { signing_key })
            .map_err(|_| CryptoError::InvalidSecretKey)
    }

    /// Parse the URL-safe base64 form produced by [`KeyPair::to_base64`].
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidEncoding(format!(
                "expected {} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Self::from_keypair_bytes(&bytes)
    }

    /// URL-safe base64 of the 64-byte expanded secret key.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.to_keypair_bytes())
    }

    /// Get the public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Get the signing (secret) key.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Get the raw bytes of the secret seed.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// The X25519 static secret matching [`PublicKey::to_x25519`].
    pub fn to_x25519(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        KeyPair {
            signing_key: SigningKey::from_bytes(self.signing_key.as_bytes()),
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key().to_base64())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_uniqueness() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::generate();
        assert_ne!(kp1.public_key(), kp2.public_key());
    }

    #[test]
    fn test_base64_is_filename_safe() {
        for _ in 0..32 {
            let text = KeyPair::generate().public_key().to_base64();
            assert_eq!(text.len(), 43);
            assert!(text
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_public_key_parse() {
        let pk = KeyPair::generate().public_key();
        let parsed: PublicKey = pk.to_string().parse().unwrap();
        assert_eq!(pk, parsed);

        assert!(PublicKey::from_base64("not a key").is_err());
        assert!(PublicKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_keypair_text_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_base64(&kp.to_base64()).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_keypair_rejects_mismatched_halves() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let mut bytes = kp.signing_key().to_keypair_bytes();
        bytes[32..].copy_from_slice(other.public_key().as_bytes());
        assert!(matches!(
            KeyPair::from_keypair_bytes(&bytes),
            Err(CryptoError::InvalidSecretKey)
        ));
    }

    #[test]
    fn test_x25519_conversion_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let ab = alice.to_x25519().diffie_hellman(&bob.public_key().to_x25519());
        let ba = bob.to_x25519().diffie_hellman(&alice.public_key().to_x25519());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_public_key_json() {
        let pk = KeyPair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_base64()));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(pk, back);
    }
}
