//! # Control-Channel Messages
//!
//! All traffic on the control channel is UTF-8 JSON of the form
//! `{"type": ..., ...}`. Anything the dispatcher cannot interpret
//! (unknown type, undecodable JSON, or a binary frame) is demoted to the
//! generic raw-control sink rather than dropped on the floor.

use serde::{Deserialize, Serialize};

use crate::transfer::FileInfo;

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Advertised maximum chunk size, sent once the channel opens.
    Capabilities { max_chunk_size: u32 },
    /// Reply fixing the negotiated chunk size for the session.
    CapabilitiesAck { negotiated_chunk_size: u32 },
    /// A chat message.
    Message { content: String },
    /// Announces the file about to be sent on the data channel.
    FileInfo {
        name: String,
        size: u64,
        md5: String,
        chunks: u32,
    },
    /// The sender has attempted every chunk; the receiver should verify
    /// or request retransmission.
    FileComplete,
    /// Sequences the receiver is still missing after a `file-complete`.
    MissingChunks { sequences: Vec<u32> },
}

impl ControlMessage {
    /// The `file-info` announcement for a transfer.
    pub fn file_info(info: &FileInfo) -> Self {
        ControlMessage::FileInfo {
            name: info.name.clone(),
            size: info.size,
            md5: info.md5.clone(),
            chunks: info.chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_wire_shape() {
        let msg = ControlMessage::Capabilities { max_chunk_size: 16384 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"capabilities","maxChunkSize":16384}"#);
    }

    #[test]
    fn test_capabilities_ack_wire_shape() {
        let msg = ControlMessage::CapabilitiesAck { negotiated_chunk_size: 9999 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"capabilities-ack","negotiatedChunkSize":9999}"#
        );
    }

    #[test]
    fn test_chat_message_round_trip() {
        let msg = ControlMessage::Message { content: "hello there".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"message""#));
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_file_info_round_trip() {
        let msg = ControlMessage::FileInfo {
            name: "report.pdf".into(),
            size: 1048576,
            md5: "0123456789abcdef0123456789abcdef".into(),
            chunks: 257,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"file-info""#));
        assert!(json.contains(r#""chunks":257"#));
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_file_complete_is_bare() {
        let msg = ControlMessage::FileComplete;
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"file-complete"}"#);
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ControlMessage::FileComplete);
    }

    #[test]
    fn test_missing_chunks_round_trip() {
        let msg = ControlMessage::MissingChunks { sequences: vec![3, 7] };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"missing-chunks","sequences":[3,7]}"#);
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unknown_type_fails_parse() {
        // The dispatcher demotes these to the raw-control sink.
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"presence","online":true}"#)
            .is_err());
        assert!(serde_json::from_str::<ControlMessage>("not json at all").is_err());
    }
}
