//! TLV8 encoding for `pairingData` blobs.
//!
//! Format: [tag: 1 byte][length: 1 byte][value: 0-255 bytes]. Values
//! longer than 255 bytes fragment across consecutive records of the same
//! tag and are re-concatenated on parse.

use std::collections::HashMap;

use mrp_core::error::ParseError;

/// Tags used inside a pairing TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TlvTag {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    SeqNo = 0x06,
    Error = 0x07,
    Signature = 0x0A,
}

/// A parsed or in-construction pairing TLV.
#[derive(Debug, Clone, Default)]
pub struct Tlv8 {
    items: HashMap<u8, Vec<u8>>,
}

impl Tlv8 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from bytes, concatenating fragmented values.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let mut items: HashMap<u8, Vec<u8>> = HashMap::new();
        let mut last_tag: Option<u8> = None;
        let mut i = 0;

        while i < data.len() {
            if i + 2 > data.len() {
                return Err(ParseError::InvalidFormat("TLV8: truncated header".to_string()));
            }

            let tag = data[i];
            let len = data[i + 1] as usize;
            i += 2;

            if i + len > data.len() {
                return Err(ParseError::InvalidFormat(format!(
                    "TLV8: truncated value (expected {} bytes, got {})",
                    len,
                    data.len() - i
                )));
            }

            let value = &data[i..i + len];
            i += len;

            if Some(tag) == last_tag {
                // Fragment continuation of the previous record.
                if let Some(existing) = items.get_mut(&tag) {
                    existing.extend_from_slice(value);
                }
            } else {
                items.insert(tag, value.to_vec());
            }
            last_tag = Some(tag);
        }

        Ok(Self { items })
    }

    /// Encode to bytes, fragmenting values over 255 bytes.
    ///
    /// Records are emitted in ascending tag order so the output is
    /// deterministic.
    pub fn encode(&self) -> Vec<u8> {
        let mut tags: Vec<u8> = self.items.keys().copied().collect();
        tags.sort_unstable();

        let mut out = Vec::new();
        for tag in tags {
            let value = &self.items[&tag];
            if value.is_empty() {
                out.push(tag);
                out.push(0);
                continue;
            }
            for chunk in value.chunks(255) {
                out.push(tag);
                out.push(chunk.len() as u8);
                out.extend_from_slice(chunk);
            }
        }
        out
    }

    pub fn set(&mut self, tag: TlvTag, value: Vec<u8>) {
        self.items.insert(tag as u8, value);
    }

    pub fn get(&self, tag: TlvTag) -> Option<&[u8]> {
        self.items.get(&(tag as u8)).map(|v| v.as_slice())
    }

    pub fn contains(&self, tag: TlvTag) -> bool {
        self.items.contains_key(&(tag as u8))
    }

    /// The single-byte sequence number, if present.
    pub fn seq(&self) -> Option<u8> {
        self.get(TlvTag::SeqNo).and_then(|v| v.first().copied())
    }

    /// The single-byte error code, if present.
    pub fn error(&self) -> Option<u8> {
        self.get(TlvTag::Error).and_then(|v| v.first().copied())
    }
}
