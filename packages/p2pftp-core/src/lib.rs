//! # p2pftp-core
//!
//! Core of a peer-to-peer file-transfer and chat client. A signaling
//! server introduces two peers by token; after the WebRTC handshake all
//! traffic is peer-to-peer over two ordered reliable data channels:
//!
//! - `p2pftp-control`: JSON control messages (chat, capabilities,
//!   transfer coordination),
//! - `p2pftp-data`: framed binary chunk records.
//!
//! ## Layers
//!
//! ```text
//! PeerSession      signaling, WebRTC handshake, session state machine
//!   └─ PeerLink    control dispatcher, capability negotiation, transfer slot
//!        ├─ transfer::sender / transfer::receiver
//!        ├─ ChannelWriter + MessageChannel (webrtc or in-process)
//!        └─ framing codec
//! ```
//!
//! The application owns an [`event::EventSink`] receiver and drains
//! everything user-visible from it.

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod event;
pub mod framing;
pub mod fsutil;
pub mod link;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use config::SessionConfig;
pub use error::{Error, ErrorKind, Result};
pub use event::{CoreEvent, EventSink, TransferDirection};
pub use session::{PeerSession, SessionState};
pub use transfer::FileInfo;
