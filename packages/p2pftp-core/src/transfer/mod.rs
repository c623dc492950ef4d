//! # Transfer Engine
//!
//! Chunked file transfer over the binary data channel.
//!
//! ```text
//! Sender                                   Receiver
//! ──────                                   ────────
//! file-info {name,size,md5,chunks}  ──────►  pre-size file, missing = all
//! chunk frames (window of W)        ──────►  positional write, shrink missing
//! file-complete                     ──────►  missing empty? verify md5
//!                                   ◄──────  missing-chunks [..] (else)
//! retransmit listed sequences       ──────►
//! file-complete                     ──────►  (max 3 rounds)
//! ```

pub mod receiver;
pub mod sender;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framing::HEADER_LEN;

pub use receiver::run_receiver;
pub use sender::run_sender;

/// Maximum `missing-chunks` retransmission rounds before the transfer is
/// declared failed (sender) or stalled (receiver).
pub const MAX_RECOVERY_ROUNDS: u32 = 3;

/// Receiver gives up after this long without a newly filled chunk.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sender retires its retransmission state after this long without a
/// `missing-chunks` request.
pub const SENDER_LINGER: Duration = Duration::from_secs(30);

/// Delay before the single per-chunk retry.
pub const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Immutable description of a file in flight. Announced once in
/// `file-info` and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Bare filename (no directory components).
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// MD5 of the full contents, 32 lowercase hex.
    pub md5: String,
    /// `ceil(size / payload_size)`.
    pub chunks: u32,
}

/// File bytes carried per frame once `chunk_size` is negotiated.
pub fn payload_size(chunk_size: u32) -> u32 {
    chunk_size - HEADER_LEN as u32
}

/// Number of chunks a `size`-byte file splits into.
pub fn chunk_count(size: u64, payload_size: u32) -> u32 {
    size.div_ceil(payload_size as u64) as u32
}

/// Length of chunk `sequence`: `payload_size` everywhere except a shorter
/// final chunk.
pub fn chunk_len(sequence: u32, size: u64, payload_size: u32) -> u32 {
    let chunks = chunk_count(size, payload_size);
    debug_assert!(sequence < chunks);
    if sequence + 1 == chunks {
        (size - (chunks as u64 - 1) * payload_size as u64) as u32
    } else {
        payload_size
    }
}

/// Byte offset of chunk `sequence` within the file.
pub fn chunk_offset(sequence: u32, payload_size: u32) -> u64 {
    sequence as u64 * payload_size as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_size_accounts_for_header() {
        assert_eq!(payload_size(4096), 4088);
        assert_eq!(payload_size(16384), 16376);
        assert_eq!(payload_size(9999), 9991);
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        assert_eq!(chunk_count(0, 4088), 0);
        assert_eq!(chunk_count(1, 4088), 1);
        assert_eq!(chunk_count(4088, 4088), 1);
        assert_eq!(chunk_count(4089, 4088), 2);
        assert_eq!(chunk_count(8176, 4088), 2);
        assert_eq!(chunk_count(8177, 4088), 3);
    }

    #[test]
    fn test_tiny_file_is_one_short_chunk() {
        // 12 bytes at payload 4088: one chunk of length 12.
        assert_eq!(chunk_count(12, 4088), 1);
        assert_eq!(chunk_len(0, 12, 4088), 12);
    }

    #[test]
    fn test_exact_multiple_has_no_partial_tail() {
        // 8176 = 2 × 4088: the last chunk is full-sized.
        assert_eq!(chunk_count(8176, 4088), 2);
        assert_eq!(chunk_len(0, 8176, 4088), 4088);
        assert_eq!(chunk_len(1, 8176, 4088), 4088);
    }

    #[test]
    fn test_one_byte_overflow_makes_tiny_tail() {
        // 4089 bytes: second chunk carries a single byte.
        assert_eq!(chunk_count(4089, 4088), 2);
        assert_eq!(chunk_len(0, 4089, 4088), 4088);
        assert_eq!(chunk_len(1, 4089, 4088), 1);
    }

    #[test]
    fn test_chunk_offsets() {
        assert_eq!(chunk_offset(0, 4088), 0);
        assert_eq!(chunk_offset(1, 4088), 4088);
        assert_eq!(chunk_offset(3, 4088), 12264);
    }

    #[test]
    fn test_lengths_sum_to_size() {
        for size in [1u64, 100, 4087, 4088, 4089, 8176, 100_000] {
            let chunks = chunk_count(size, 4088);
            let total: u64 = (0..chunks).map(|s| chunk_len(s, size, 4088) as u64).sum();
            assert_eq!(total, size, "size {}", size);
        }
    }
}
