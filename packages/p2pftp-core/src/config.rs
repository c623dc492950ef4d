//! # Session Configuration

use std::path::PathBuf;

use crate::framing::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Default advertised maximum chunk size. Some SCTP stacks cap usable
/// message sizes well below this; 8192 is a safe fallback there.
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 16384;

/// Default sliding-window size: concurrently in-flight chunks per transfer.
pub const DEFAULT_WINDOW: usize = 8;

/// Pause window dispatch while the channel buffers more than this.
pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;

/// Resume once the channel's buffered amount drops below this.
pub const DEFAULT_LOW_WATER: usize = 64 * 1024;

/// STUN servers for ICE candidate gathering.
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Configuration for a peer session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// User-supplied signaling base URL (`host`, `host:port`, or full URL).
    pub server: String,
    /// STUN server URLs handed to the peer-connection stack.
    pub stun_servers: Vec<String>,
    /// Our advertised maximum chunk size, clamped during negotiation.
    pub max_chunk_size: u32,
    /// Sliding-window size for chunk dispatch.
    pub window: usize,
    /// Directory incoming files are written to.
    pub download_dir: PathBuf,
    /// Buffered-amount high-water mark in bytes.
    pub high_water: usize,
    /// Buffered-amount low-water mark in bytes.
    pub low_water: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            stun_servers: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            window: DEFAULT_WINDOW,
            download_dir: PathBuf::from("."),
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
        }
    }
}

impl SessionConfig {
    /// Config for the given signaling server with defaults elsewhere.
    pub fn for_server(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }
}

/// Clamp an advertised chunk size into the protocol bounds.
pub fn clamp_chunk_size(advertised: u32) -> u32 {
    advertised.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// The chunk size both sides will use: the smaller of the two
/// advertisements, clamped into protocol bounds.
pub fn negotiate_chunk_size(local: u32, peer: u32) -> u32 {
    clamp_chunk_size(local).min(clamp_chunk_size(peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::HEADER_LEN;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_chunk_size, 16384);
        assert_eq!(config.window, 8);
        assert_eq!(config.high_water, 256 * 1024);
        assert_eq!(config.low_water, 64 * 1024);
        assert!(!config.stun_servers.is_empty());
    }

    #[test]
    fn test_negotiation_picks_smaller_side() {
        assert_eq!(negotiate_chunk_size(16384, 16384), 16384);
        assert_eq!(negotiate_chunk_size(16384, 8192), 8192);
        assert_eq!(negotiate_chunk_size(4096, 65536), 4096);
    }

    #[test]
    fn test_negotiation_clamps_out_of_range_peers() {
        // Peer advertises below the floor.
        assert_eq!(negotiate_chunk_size(16384, 16), 1024);
        // Peer advertises above the ceiling.
        assert_eq!(negotiate_chunk_size(65536, 1 << 20), 65536);
    }

    #[test]
    fn test_negotiation_literal_pair() {
        // local 32768, peer 9999 → negotiated 9999, payload 9991
        let negotiated = negotiate_chunk_size(32768, 9999);
        assert_eq!(negotiated, 9999);
        assert_eq!(negotiated - HEADER_LEN as u32, 9991);
    }
}
