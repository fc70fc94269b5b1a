//! Ephemeral X25519 key agreement.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// A per-connection X25519 key pair.
///
/// Backed by a `StaticSecret` because the handshake performs more than one
/// agreement with the same ephemeral secret.
pub struct EphemeralKey {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKey {
    /// Generate a fresh ephemeral key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Public half as raw bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Shared secret with a remote X25519 public key.
    pub fn agree(&self, remote: &X25519Public) -> [u8; 32] {
        self.secret.diffie_hellman(remote).to_bytes()
    }

    /// Shared secret with a remote public key given as raw bytes.
    pub fn agree_bytes(&self, remote: [u8; 32]) -> [u8; 32] {
        self.agree(&X25519Public::from(remote))
    }
}
