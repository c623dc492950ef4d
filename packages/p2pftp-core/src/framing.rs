//! # Chunk Framing
//!
//! Every frame on the data channel is one chunk record:
//!
//! ```text
//! offset  size  field
//! 0       4     sequence   (big-endian u32)
//! 4       4     length     (big-endian u32, == payload length)
//! 8       len   payload
//! ```
//!
//! The codec validates structure only. Sequence range checking against the
//! announced chunk count is the receiver's job.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Chunk record header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Smallest chunk size either side may negotiate.
pub const MIN_CHUNK_SIZE: u32 = 1024;

/// Largest chunk size either side may negotiate.
pub const MAX_CHUNK_SIZE: u32 = 65536;

/// Encode one chunk record.
///
/// Rejects empty payloads and payloads beyond what the largest negotiable
/// chunk can carry.
pub fn encode_chunk(sequence: u32, payload: &[u8]) -> Result<Bytes> {
    if payload.is_empty() {
        return Err(Error::MalformedChunk("empty payload".into()));
    }
    let max_payload = MAX_CHUNK_SIZE as usize - HEADER_LEN;
    if payload.len() > max_payload {
        return Err(Error::DataSizeExceeded {
            len: payload.len(),
            max: max_payload,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(sequence);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode one chunk record, returning `(sequence, payload)`.
///
/// `payload_size` is the negotiated per-chunk payload limit; anything
/// larger is malformed for this session even if structurally consistent.
pub fn decode_chunk(frame: &[u8], payload_size: u32) -> Result<(u32, &[u8])> {
    if frame.len() < HEADER_LEN {
        return Err(Error::MalformedChunk(format!(
            "frame of {} bytes is shorter than the {}-byte header",
            frame.len(),
            HEADER_LEN
        )));
    }

    let sequence = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let length = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

    if length as usize != frame.len() - HEADER_LEN {
        return Err(Error::MalformedChunk(format!(
            "declared length {} does not match {} payload bytes",
            length,
            frame.len() - HEADER_LEN
        )));
    }
    if length == 0 {
        return Err(Error::MalformedChunk("zero-length chunk".into()));
    }
    if length > payload_size {
        return Err(Error::MalformedChunk(format!(
            "declared length {} exceeds the negotiated payload size {}",
            length, payload_size
        )));
    }

    Ok((sequence, &frame[HEADER_LEN..]))
}
