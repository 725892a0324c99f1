//! Persistent pairing credentials.
//!
//! A successful pair-setup yields one `Credentials` value. The caller owns
//! it and passes it back on every later connection so pair-verify can run
//! without a PIN. Serialized form is a colon-joined hex string suitable
//! for a config file or keychain entry.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroize;

use crate::error::ParseError;

/// Long-term pairing identity for one client/device relationship.
///
/// Invariant: both key fields are exactly 32 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Stable client identity (UUID string), chosen at pair time.
    pub pairing_id: String,
    /// Ed25519 seed of the client's long-term signing key.
    pub local_private_key: [u8; 32],
    /// Device identifier announced during pair-setup M6.
    pub remote_peer_id: String,
    /// Device's long-term Ed25519 public key.
    pub remote_public_key: [u8; 32],
}

impl Credentials {
    pub fn new(
        pairing_id: String,
        local_private_key: [u8; 32],
        remote_peer_id: String,
        remote_public_key: [u8; 32],
    ) -> Self {
        Self {
            pairing_id,
            local_private_key,
            remote_peer_id,
            remote_public_key,
        }
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.local_private_key.zeroize();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the private seed.
        f.debug_struct("Credentials")
            .field("pairing_id", &self.pairing_id)
            .field("remote_peer_id", &self.remote_peer_id)
            .field("remote_public_key", &hex::encode(self.remote_public_key))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Credentials {
    /// Emits `hex(pairing_id):hex(seed):hex(peer_id):hex(peer_pub)`,
    /// strictly lowercase.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            hex::encode(self.pairing_id.as_bytes()),
            hex::encode(self.local_private_key),
            hex::encode(self.remote_peer_id.as_bytes()),
            hex::encode(self.remote_public_key),
        )
    }
}

impl FromStr for Credentials {
    type Err = ParseError;

    /// Parses the colon-joined form. Hex is accepted case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let pairing_id = next_utf8(&mut parts, "pairing_id")?;
        let local_private_key = next_key(&mut parts, "local_private_key")?;
        let remote_peer_id = next_utf8(&mut parts, "remote_peer_id")?;
        let remote_public_key = next_key(&mut parts, "remote_public_key")?;

        if parts.next().is_some() {
            return Err(ParseError::InvalidFormat(
                "credentials have trailing segments".to_string(),
            ));
        }

        Ok(Self {
            pairing_id,
            local_private_key,
            remote_peer_id,
            remote_public_key,
        })
    }
}

fn next_hex<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<Vec<u8>, ParseError> {
    let part = parts.next().ok_or(ParseError::MissingField(field))?;
    hex::decode(part).map_err(|_| ParseError::InvalidHex(part.to_string()))
}

fn next_utf8<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<String, ParseError> {
    let raw = next_hex(parts, field)?;
    String::from_utf8(raw)
        .map_err(|_| ParseError::InvalidFormat(format!("{field} is not valid UTF-8")))
}

fn next_key<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<[u8; 32], ParseError> {
    let raw = next_hex(parts, field)?;
    raw.try_into()
        .map_err(|_| ParseError::InvalidFormat(format!("{field} must be 32 bytes")))
}
