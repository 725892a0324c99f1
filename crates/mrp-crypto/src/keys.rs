//! Session key types and derivation.

use mrp_core::error::CryptoError;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hkdf;

/// Shared secret from SRP or X25519.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

/// 32-byte encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

/// Per-connection session keys produced by pair-verify.
///
/// `write_key` encrypts frames the client sends; `read_key` decrypts
/// frames the device sends. Destroyed when the transport closes.
#[derive(ZeroizeOnDrop)]
pub struct SessionKeys {
    pub write_key: EncryptionKey,
    pub read_key: EncryptionKey,
}

impl SharedSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl SessionKeys {
    /// Derive the session key pair from the pair-verify shared secret.
    ///
    /// Labels follow the device's orientation: the client's write key is
    /// derived with `ClientEncrypt-main`, its read key with
    /// `ServerEncrypt-main`.
    pub fn derive(shared_secret: &SharedSecret) -> Result<Self, CryptoError> {
        let write_key = hkdf::derive_client_write_key(shared_secret.as_bytes())?;
        let read_key = hkdf::derive_client_read_key(shared_secret.as_bytes())?;
        Ok(Self {
            write_key: EncryptionKey(write_key),
            read_key: EncryptionKey(read_key),
        })
    }
}
