//! # Error Handling
//!
//! One error type for the whole core, organized by the phase that can
//! produce it: signaling, session negotiation, channel sends, transfer.
//!
//! Every error carries a stable [`ErrorKind`] tag. The tag, not the Rust
//! variant name, is the contract with the UI layer: status lines render
//! the human-readable message, automation switches on the kind.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the p2pftp core.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Signaling errors
    // ========================================================================
    /// Could not reach the signaling server at all.
    #[error("signaling server unreachable: {0}")]
    SignalingUnreachable(String),

    /// The signaling stream dropped or refused a write.
    #[error("signaling connection closed")]
    SignalingClosed,

    /// The server did not assign a token within the registration window.
    #[error("timed out waiting for a token from the signaling server")]
    TokenTimeout,

    // ========================================================================
    // Session errors
    // ========================================================================
    /// The offer/answer exchange failed: the peer's description was
    /// refused or could not be applied.
    #[error("connection offer failed: {0}")]
    OfferRejected(String),

    /// The remote peer declined the connection request.
    #[error("peer {0} rejected the connection")]
    PeerRejected(String),

    /// ICE checking did not reach connected/completed in time. The
    /// underlying stack is left alone; it may still recover.
    #[error("connection timed out")]
    IceTimeout,

    /// Capability exchange did not complete in time. Fatal to the session.
    #[error("capability exchange timed out")]
    CapabilitiesTimeout,

    /// The session has been closed; all pending operations error out.
    #[error("session closed")]
    SessionClosed,

    /// An operation was issued in a state that does not permit it
    /// (e.g. `/connect` before registration, `/send` before ready).
    #[error("invalid operation: {0}")]
    InvalidState(String),

    // ========================================================================
    // Channel send errors
    // ========================================================================
    /// A send was attempted on a channel that is not open.
    #[error("channel {0} is not open")]
    ChannelNotOpen(String),

    /// A payload exceeded the maximum the channel will carry.
    #[error("payload of {len} bytes exceeds the {max}-byte channel limit")]
    DataSizeExceeded { len: usize, max: usize },

    /// The underlying transport refused an operation.
    #[error("transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Transfer errors
    // ========================================================================
    /// A data-channel frame failed structural validation.
    #[error("malformed chunk: {0}")]
    MalformedChunk(String),

    /// A chunk's sequence number is outside the announced chunk count.
    #[error("chunk sequence {sequence} out of range (file has {chunks} chunks)")]
    SequenceOutOfRange { sequence: u32, chunks: u32 },

    /// The reassembled file does not hash to the announced MD5.
    #[error("integrity check failed: expected md5 {expected}, computed {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// The receiver stopped making progress.
    #[error("transfer stalled: {0}")]
    TransferStalled(String),

    /// The transfer could not be completed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    // ========================================================================
    // Wrapped faults
    // ========================================================================
    /// Filesystem fault while reading, writing, or hashing.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode fault on a wire message.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable error-kind tags surfaced alongside every reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SignalingUnreachable,
    SignalingClosed,
    TokenTimeout,
    OfferRejected,
    PeerRejected,
    IceTimeout,
    CapabilitiesTimeout,
    SessionClosed,
    ChannelNotOpen,
    DataSizeExceeded,
    MalformedChunk,
    SequenceOutOfRange,
    IntegrityMismatch,
    TransferStalled,
    TransferFailed,
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind ends the session when reported.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::OfferRejected
                | ErrorKind::PeerRejected
                | ErrorKind::CapabilitiesTimeout
                | ErrorKind::SessionClosed
        )
    }

    /// The tag as it appears in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SignalingUnreachable => "SignalingUnreachable",
            ErrorKind::SignalingClosed => "SignalingClosed",
            ErrorKind::TokenTimeout => "TokenTimeout",
            ErrorKind::OfferRejected => "OfferRejected",
            ErrorKind::PeerRejected => "PeerRejected",
            ErrorKind::IceTimeout => "IceTimeout",
            ErrorKind::CapabilitiesTimeout => "CapabilitiesTimeout",
            ErrorKind::SessionClosed => "SessionClosed",
            ErrorKind::ChannelNotOpen => "ChannelNotOpen",
            ErrorKind::DataSizeExceeded => "DataSizeExceeded",
            ErrorKind::MalformedChunk => "MalformedChunk",
            ErrorKind::SequenceOutOfRange => "SequenceOutOfRange",
            ErrorKind::IntegrityMismatch => "IntegrityMismatch",
            ErrorKind::TransferStalled => "TransferStalled",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// The stable tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SignalingUnreachable(_) => ErrorKind::SignalingUnreachable,
            Error::SignalingClosed => ErrorKind::SignalingClosed,
            Error::TokenTimeout => ErrorKind::TokenTimeout,
            Error::OfferRejected(_) => ErrorKind::OfferRejected,
            Error::PeerRejected(_) => ErrorKind::PeerRejected,
            Error::IceTimeout => ErrorKind::IceTimeout,
            Error::CapabilitiesTimeout => ErrorKind::CapabilitiesTimeout,
            Error::SessionClosed => ErrorKind::SessionClosed,
            Error::InvalidState(_) => ErrorKind::Internal,
            Error::ChannelNotOpen(_) => ErrorKind::ChannelNotOpen,
            Error::DataSizeExceeded { .. } => ErrorKind::DataSizeExceeded,
            Error::Transport(_) => ErrorKind::Internal,
            Error::MalformedChunk(_) => ErrorKind::MalformedChunk,
            Error::SequenceOutOfRange { .. } => ErrorKind::SequenceOutOfRange,
            Error::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Error::TransferStalled(_) => ErrorKind::TransferStalled,
            Error::TransferFailed(_) => ErrorKind::TransferFailed,
            Error::Io(_) => ErrorKind::Internal,
            Error::Json(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error tears down the whole session.
    ///
    /// Transfer faults leave the session open; send-path faults are
    /// returned to the caller; only the kinds in
    /// [`ErrorKind::is_session_fatal`] end the peer connection.
    pub fn is_fatal_to_session(&self) -> bool {
        self.kind().is_session_fatal()
    }

    /// Whether this error ends only the active transfer.
    pub fn is_fatal_to_transfer(&self) -> bool {
        matches!(
            self,
            Error::IntegrityMismatch { .. }
                | Error::TransferStalled(_)
                | Error::TransferFailed(_)
                | Error::SessionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::TokenTimeout.kind(), ErrorKind::TokenTimeout);
        assert_eq!(Error::SignalingClosed.kind().as_str(), "SignalingClosed");
        assert_eq!(
            Error::MalformedChunk("short".into()).kind(),
            ErrorKind::MalformedChunk
        );
        assert_eq!(
            Error::SequenceOutOfRange { sequence: 9, chunks: 4 }.kind(),
            ErrorKind::SequenceOutOfRange
        );
        assert_eq!(
            Error::DataSizeExceeded { len: 70000, max: 65536 }.kind(),
            ErrorKind::DataSizeExceeded
        );
    }

    #[test]
    fn test_session_fatality() {
        assert!(Error::CapabilitiesTimeout.is_fatal_to_session());
        assert!(Error::SessionClosed.is_fatal_to_session());
        assert!(Error::PeerRejected("ab12".into()).is_fatal_to_session());
        assert!(Error::OfferRejected("bad sdp".into()).is_fatal_to_session());
        assert!(!Error::IceTimeout.is_fatal_to_session());
        assert!(!Error::IntegrityMismatch {
            expected: "a".repeat(32),
            actual: "b".repeat(32),
        }
        .is_fatal_to_session());
    }

    #[test]
    fn test_kind_level_fatality_matches_error_level() {
        assert!(ErrorKind::OfferRejected.is_session_fatal());
        assert!(ErrorKind::PeerRejected.is_session_fatal());
        assert!(ErrorKind::CapabilitiesTimeout.is_session_fatal());
        assert!(ErrorKind::SessionClosed.is_session_fatal());
        assert!(!ErrorKind::IceTimeout.is_session_fatal());
        assert!(!ErrorKind::IntegrityMismatch.is_session_fatal());
        assert!(!ErrorKind::Internal.is_session_fatal());
    }

    #[test]
    fn test_transfer_fatality() {
        assert!(Error::TransferStalled("no progress".into()).is_fatal_to_transfer());
        assert!(Error::TransferFailed("3 rounds".into()).is_fatal_to_transfer());
        assert!(!Error::MalformedChunk("dropped".into()).is_fatal_to_transfer());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::ChannelNotOpen("p2pftp-data".into());
        assert!(err.to_string().contains("p2pftp-data"));

        let err = Error::IntegrityMismatch {
            expected: "0".repeat(32),
            actual: "f".repeat(32),
        };
        assert!(err.to_string().contains("integrity"));
    }
}
