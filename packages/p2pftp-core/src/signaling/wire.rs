//! # Signaling Wire Messages
//!
//! JSON messages exchanged with the signaling server. Must match the
//! server's schema exactly: lowercase `type` tags, camelCase fields.
//!
//! The SDP and ICE payloads are opaque strings produced and consumed by
//! the peer-connection stack; signaling never inspects them.

use serde::{Deserialize, Serialize};

/// A signaling message, in either direction.
///
/// Inbound: `token`, `request`, `accepted`, `rejected`, `offer`, `answer`,
/// `ice`. Outbound: `connect`, `accept`, `offer`, `answer`, `ice`.
/// Unknown inbound types are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Server → us: our assigned token.
    Token { token: String },
    /// Server → us: a peer wants to connect.
    Request { token: String },
    /// Server → us: the peer accepted our connection request.
    Accepted { token: String },
    /// Server → us: the peer rejected our connection request.
    Rejected { token: String },
    /// SDP offer, relayed verbatim.
    Offer { peer_token: String, sdp: String },
    /// SDP answer, relayed verbatim.
    Answer { peer_token: String, sdp: String },
    /// One ICE candidate, relayed verbatim.
    Ice { peer_token: String, ice: String },
    /// Us → server: request a connection to a peer.
    Connect { peer_token: String },
    /// Us → server: accept a peer's connection request.
    Accept { peer_token: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_deserializes() {
        let json = r#"{"type":"token","token":"ab12"}"#;
        let msg: SignalMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, SignalMessage::Token { token: "ab12".into() });
    }

    #[test]
    fn test_connect_serializes_with_camel_case_field() {
        let msg = SignalMessage::Connect { peer_token: "cd34".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connect""#));
        assert!(json.contains(r#""peerToken":"cd34""#));
    }

    #[test]
    fn test_accept_serializes() {
        let msg = SignalMessage::Accept { peer_token: "cd34".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"accept""#));
    }

    #[test]
    fn test_offer_round_trip() {
        let msg = SignalMessage::Offer {
            peer_token: "cd34".into(),
            sdp: "{\"type\":\"offer\",\"sdp\":\"v=0...\"}".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""peerToken":"cd34""#));
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_ice_round_trip() {
        let msg = SignalMessage::Ice {
            peer_token: "cd34".into(),
            ice: "{\"candidate\":\"candidate:1 1 udp ...\"}".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_request_and_verdicts_deserialize() {
        let request: SignalMessage =
            serde_json::from_str(r#"{"type":"request","token":"ef56"}"#).unwrap();
        assert_eq!(request, SignalMessage::Request { token: "ef56".into() });

        let accepted: SignalMessage =
            serde_json::from_str(r#"{"type":"accepted","token":"ef56"}"#).unwrap();
        assert_eq!(accepted, SignalMessage::Accepted { token: "ef56".into() });

        let rejected: SignalMessage =
            serde_json::from_str(r#"{"type":"rejected","token":"ef56"}"#).unwrap();
        assert_eq!(rejected, SignalMessage::Rejected { token: "ef56".into() });
    }

    #[test]
    fn test_unknown_type_fails_parse() {
        // The reader drops these with a log line rather than erroring out.
        let result = serde_json::from_str::<SignalMessage>(r#"{"type":"shiny-new-thing"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_all_outbound_messages_round_trip() {
        let messages = vec![
            SignalMessage::Connect { peer_token: "p1".into() },
            SignalMessage::Accept { peer_token: "p1".into() },
            SignalMessage::Offer { peer_token: "p1".into(), sdp: "o".into() },
            SignalMessage::Answer { peer_token: "p1".into(), sdp: "a".into() },
            SignalMessage::Ice { peer_token: "p1".into(), ice: "c".into() },
        ];
        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, msg, "round-trip failed for {}", json);
        }
    }
}
