//! Varint-length frame codec.
//!
//! Every wire frame is `varint(length) || payload`. The decoder keeps a
//! rolling buffer so a frame may arrive split across any number of reads,
//! including mid-varint.

use bytes::{Buf, Bytes, BytesMut};
use mrp_core::error::DecodeError;

/// Upper bound on a single frame; anything larger is a corrupt prefix.
const MAX_FRAME_LEN: usize = 1 << 22;

/// Prefix a payload with its varint length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    put_varint(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

fn put_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Try to read a varint from the front of `data`.
///
/// Returns `Ok(None)` when the buffer ends mid-varint, `Ok(Some((value,
/// consumed)))` on success.
fn take_varint(data: &[u8]) -> Result<Option<(u64, usize)>, DecodeError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 {
            return Err(DecodeError::BadLengthPrefix);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Incremental frame decoder over a rolling inbound buffer.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let (len, prefix_len) = match take_varint(&self.buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        let len = usize::try_from(len).map_err(|_| DecodeError::Oversize(usize::MAX))?;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::Oversize(len));
        }

        if self.buf.len() < prefix_len + len {
            return Ok(None);
        }

        self.buf.advance(prefix_len);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes currently buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
