//! SHA-256 hashing and HMAC utilities.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Compute SHA-256 hash of the input data.
#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash of concatenated data slices.
///
/// More efficient than allocating a buffer for concatenation.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Compute HMAC-SHA-256 of `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, new_from_slice cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Check an HMAC-SHA-256 tag in constant time.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| CryptoError::MacMismatch)?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)
}
