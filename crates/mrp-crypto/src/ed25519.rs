//! Ed25519 signatures for long-term identity keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use mrp_core::error::CryptoError;
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

/// Long-term Ed25519 identity key pair (LTSK/LTPK).
///
/// Clone is implemented so the same identity can be shared between the
/// pairing phases; both copies zeroize on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeys {
    #[zeroize(skip)]
    public: [u8; 32],
    seed: [u8; 32],
}

impl IdentityKeys {
    /// Generate a new random identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            seed: signing_key.to_bytes(),
        }
    }

    /// Rebuild from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            seed: *seed,
        }
    }

    /// The public key (32 bytes).
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Export the seed for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    /// Sign a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signing_key = SigningKey::from_bytes(&self.seed);
        signing_key.sign(message).to_bytes()
    }
}

/// Verify a 64-byte signature against a 32-byte public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| CryptoError::KeyDerivation("invalid Ed25519 public key".to_string()))?;
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::Decryption("Ed25519 signature mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = IdentityKeys::generate();
        let sig = keys.sign(b"attestation");
        assert!(verify(&keys.public_key(), b"attestation", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_modified_message() {
        let keys = IdentityKeys::generate();
        let sig = keys.sign(b"attestation");
        assert!(verify(&keys.public_key(), b"attestatioN", &sig).is_err());
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let keys = IdentityKeys::generate();
        let other = IdentityKeys::generate();
        let sig = keys.sign(b"attestation");
        assert!(verify(&other.public_key(), b"attestation", &sig).is_err());
    }

    #[test]
    fn seed_round_trip_preserves_identity() {
        let keys = IdentityKeys::generate();
        let restored = IdentityKeys::from_seed(&keys.seed());
        assert_eq!(keys.public_key(), restored.public_key());

        let sig = restored.sign(b"msg");
        assert!(verify(&keys.public_key(), b"msg", &sig).is_ok());
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = IdentityKeys::generate();
        let b = IdentityKeys::generate();
        assert_ne!(a.public_key(), b.public_key());
    }
}
