//! The deployment-wide application key.
//!
//! Every peer of one deployment is provisioned with the same 32-byte key.
//! Knowing it is what entitles a peer to complete a handshake; peers holding
//! different keys cannot talk to each other.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Application key length in bytes.
pub const APP_KEY_LENGTH: usize = 32;

/// Shared 32-byte capability key.
#[derive(Clone, PartialEq, Eq)]
pub struct AppKey([u8; APP_KEY_LENGTH]);

impl AppKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; APP_KEY_LENGTH]) -> Self {
        AppKey(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; APP_KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        AppKey(bytes)
    }

    /// Parse URL-safe base64 text.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let bytes: [u8; APP_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidEncoding(format!(
                "expected {} bytes, got {}",
                APP_KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(AppKey(bytes))
    }

    /// URL-safe base64 text.
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; APP_KEY_LENGTH] {
        &self.0
    }
}

impl FromStr for AppKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

// Never print key material.
impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_and_redaction() {
        let key = AppKey::generate();
        let parsed: AppKey = key.to_base64().parse().unwrap();
        assert_eq!(key, parsed);
        assert_eq!(format!("{:?}", key), "AppKey(..)");
    }

    #[test]
    fn test_rejects_wrong_length() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(matches!(
            AppKey::from_base64(&short),
            Err(CryptoError::InvalidEncoding(_))
        ));
    }
}
