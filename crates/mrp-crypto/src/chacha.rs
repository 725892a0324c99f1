//! ChaCha20-Poly1305 AEAD for the session channel and pairing blobs.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use mrp_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Session channel cipher with per-direction keys and counters.
///
/// Each frame uses a 96-bit nonce of 32 zero bits followed by a 64-bit
/// little-endian counter. Counters start at zero and advance by one per
/// frame, independently for each direction. No AAD is used; the 16-byte
/// tag is appended to the ciphertext. A tag failure on decrypt is fatal
/// to the session.
#[derive(ZeroizeOnDrop)]
pub struct SessionCipher {
    write_key: [u8; 32],
    read_key: [u8; 32],
    #[zeroize(skip)]
    write_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    read_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    write_counter: u64,
    #[zeroize(skip)]
    read_counter: u64,
}

impl SessionCipher {
    /// Create a cipher with separate write/read keys.
    pub fn new(write_key: [u8; 32], read_key: [u8; 32]) -> Self {
        let write_cipher = ChaCha20Poly1305::new(&write_key.into());
        let read_cipher = ChaCha20Poly1305::new(&read_key.into());
        Self {
            write_key,
            read_key,
            write_cipher,
            read_cipher,
            write_counter: 0,
            read_counter: 0,
        }
    }

    /// Encrypt one outbound frame payload, advancing the write counter.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = counter_nonce(self.write_counter);
        let sealed = self
            .write_cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(format!("encrypt failed: {e}")))?;
        self.write_counter += 1;
        Ok(sealed)
    }

    /// Decrypt one inbound frame payload, advancing the read counter.
    pub fn decrypt(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_with_tag.len() < 16 {
            return Err(CryptoError::Decryption(
                "ciphertext too short (missing tag)".to_string(),
            ));
        }
        let nonce = counter_nonce(self.read_counter);
        let plain = self
            .read_cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext_with_tag)
            .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))?;
        self.read_counter += 1;
        Ok(plain)
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    pub fn read_counter(&self) -> u64 {
        self.read_counter
    }
}

/// 96-bit nonce: 4 zero bytes then the counter in little-endian.
fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with an explicit 12-byte nonce (pairing sub-protocols).
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(format!("invalid key: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("encrypt failed: {e}")))
}

/// Decrypt with an explicit 12-byte nonce (pairing sub-protocols).
///
/// Expects ciphertext with the 16-byte tag appended.
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < 16 {
        return Err(CryptoError::Decryption(
            "ciphertext too short (missing tag)".to_string(),
        ));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Decryption(format!("invalid key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))
}

/// Build a 12-byte nonce from a label, right-aligned and zero-padded.
///
/// Pairing nonces like `PS-Msg05` become `\x00\x00\x00\x00PS-Msg05`.
pub fn nonce_from_string(s: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = s.len().min(12);
    nonce[12 - len..].copy_from_slice(&s[..len]);
    nonce
}
