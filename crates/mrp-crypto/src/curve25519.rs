//! X25519 ECDH for session key agreement.

use mrp_core::error::CryptoError;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

/// Ephemeral Curve25519 key pair, one per verify exchange.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeys {
    #[zeroize(skip)]
    public: [u8; 32],
    secret: [u8; 32],
}

impl EphemeralKeys {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: public.to_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Rebuild from secret bytes (tests and deterministic flows).
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let static_secret = StaticSecret::from(*secret);
        let public = PublicKey::from(&static_secret);
        Self {
            public: public.to_bytes(),
            secret: *secret,
        }
    }

    /// The public key (32 bytes).
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Perform the key exchange, consuming the ephemeral secret.
    ///
    /// Rejects all-zero peer keys and low-order results.
    pub fn diffie_hellman(self, peer_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        if peer_public.iter().all(|&b| b == 0) {
            return Err(CryptoError::KeyDerivation(
                "invalid peer public key: all zeros".to_string(),
            ));
        }

        let secret = StaticSecret::from(self.secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));

        let shared_bytes = shared.to_bytes();
        if shared_bytes.iter().all(|&b| b == 0) {
            return Err(CryptoError::KeyDerivation(
                "weak ECDH result: low-order point".to_string(),
            ));
        }

        Ok(shared_bytes)
    }
}
