//! # Core Events
//!
//! Everything the core wants the application to see flows through one
//! injected [`EventSink`]: token assignment, chat, status lines, transfer
//! progress, and tagged errors. The sink is an unbounded channel; the
//! application drains the paired receiver at its own pace.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorKind};

/// Direction of a transfer relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We are sending the file.
    Send,
    /// We are receiving the file.
    Receive,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferDirection::Send => f.write_str("send"),
            TransferDirection::Receive => f.write_str("receive"),
        }
    }
}

/// Events emitted by the core for the application layer.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The signaling server assigned us a token.
    TokenAssigned { token: String },

    /// A peer asked to connect to us; answer with `accept`.
    PeerRequest { token: String },

    /// A chat message arrived from the peer.
    ChatMessage { content: String },

    /// A human-readable status line.
    StatusUpdate { message: String },

    /// Transfer progress after each chunk completion.
    ///
    /// `completed` counts completions in completion order, not sequence
    /// order. For receives, `succeeded == completed` and `failed == 0`.
    TransferProgress {
        direction: TransferDirection,
        completed: u32,
        total: u32,
        succeeded: u32,
        failed: u32,
    },

    /// A transfer finished on this side.
    TransferDone {
        direction: TransferDirection,
        name: String,
        size: u64,
    },

    /// Control-channel traffic the dispatcher could not interpret
    /// (unknown type, undecodable JSON, or a binary frame).
    RawControl { payload: Bytes },

    /// A reported error with its stable kind tag.
    Error { kind: ErrorKind, detail: String },
}

/// Cloneable handle for emitting [`CoreEvent`]s.
///
/// Emission never blocks and never fails: if the application dropped the
/// receiver, events are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the application drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event.
    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Emit a status line.
    pub fn status(&self, message: impl Into<String>) {
        self.emit(CoreEvent::StatusUpdate { message: message.into() });
    }

    /// Emit an incoming chat message.
    pub fn chat(&self, content: impl Into<String>) {
        self.emit(CoreEvent::ChatMessage { content: content.into() });
    }

    /// Report an error with its kind tag.
    pub fn error(&self, err: &Error) {
        self.emit(CoreEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        });
    }
}
