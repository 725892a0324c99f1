//! # mrp-crypto
//!
//! Cryptographic primitives for MediaRemote authentication and session
//! encryption:
//! - SRP-6a (3072-bit) for PIN pair-setup
//! - X25519 ECDH for pair-verify key agreement
//! - Ed25519 long-term identity signatures
//! - ChaCha20-Poly1305 AEAD for pairing blobs and the session channel
//! - HKDF-SHA512 key derivation
//! - TLV8 for `pairingData` payloads
//!
//! Secret material is zeroized on drop.

pub mod chacha;
pub mod curve25519;
pub mod ed25519;
pub mod hkdf;
pub mod keys;
pub mod srp;
pub mod tlv;

pub use chacha::SessionCipher;
pub use keys::{EncryptionKey, SessionKeys, SharedSecret};
pub use tlv::{Tlv8, TlvTag};
