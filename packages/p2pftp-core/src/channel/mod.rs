//! # Channel Abstraction
//!
//! The session talks to its two data channels through [`MessageChannel`]:
//! an opaque ordered reliable byte-message pipe with open/message/close
//! callbacks surfaced as an event stream, plus a buffered-amount hint.
//!
//! [`ChannelWriter`] puts a bounded outbound queue and a dedicated writer
//! task in front of a channel. Callers enqueue and move on; each send
//! returns a completion ticket that may be awaited or ignored. Failures
//! are logged either way, never silently lost.

pub mod memory;
pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{Error, Result};

/// Label of the JSON control channel.
pub const CONTROL_LABEL: &str = "p2pftp-control";

/// Label of the binary chunk channel.
pub const DATA_LABEL: &str = "p2pftp-data";

/// Inbound events from a channel endpoint, in delivery order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel transitioned to open.
    Open,
    /// A text message arrived.
    Text(String),
    /// A binary message arrived.
    Binary(Bytes),
    /// The channel closed.
    Closed,
    /// The transport reported an error.
    Error(String),
}

/// An ordered reliable byte-message channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// The channel's label; binding is by label, not by id.
    fn label(&self) -> &str;

    /// Whether the channel currently reports open.
    fn is_open(&self) -> bool;

    /// Bytes queued in the transport but not yet sent.
    async fn buffered_amount(&self) -> usize;

    /// Send a text message.
    async fn send_text(&self, text: String) -> Result<()>;

    /// Send a binary message.
    async fn send_binary(&self, payload: Bytes) -> Result<()>;

    /// Resolve once the buffered amount drops below the low-water mark.
    async fn wait_buffered_low(&self);

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

enum OutboundPayload {
    Text(String),
    Binary(Bytes),
}

struct Outbound {
    payload: OutboundPayload,
    done: oneshot::Sender<Result<()>>,
}

/// Depth of the per-channel outbound queue.
const WRITER_QUEUE: usize = 32;

/// Bounded outbound queue with a dedicated writer task.
///
/// Binary sends respect the buffered-amount watermark: dispatch pauses
/// while the transport buffers more than `high_water` and resumes on the
/// low-water callback.
#[derive(Clone)]
pub struct ChannelWriter {
    label: String,
    tx: mpsc::Sender<Outbound>,
}

impl ChannelWriter {
    /// Spawn the writer task for `channel`.
    pub fn spawn(channel: Arc<dyn MessageChannel>, high_water: usize) -> Self {
        let label = channel.label().to_string();
        let (tx, mut rx) = mpsc::channel::<Outbound>(WRITER_QUEUE);

        let task_label = label.clone();
        tokio::spawn(async move {
            while let Some(Outbound { payload, done }) = rx.recv().await {
                let result = match payload {
                    OutboundPayload::Text(text) => channel.send_text(text).await,
                    OutboundPayload::Binary(bytes) => {
                        if channel.buffered_amount().await > high_water {
                            channel.wait_buffered_low().await;
                        }
                        channel.send_binary(bytes).await
                    }
                };
                if let Err(e) = &result {
                    warn!(channel = %task_label, error = %e, "channel send failed");
                }
                let _ = done.send(result);
            }
        });

        Self { label, tx }
    }

    /// The label of the channel this writer fronts.
    pub fn label(&self) -> &str {
        &self.label
    }

    async fn enqueue(&self, payload: OutboundPayload) -> Result<oneshot::Receiver<Result<()>>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Outbound { payload, done: done_tx })
            .await
            .map_err(|_| Error::ChannelNotOpen(self.label.clone()))?;
        Ok(done_rx)
    }

    async fn await_ticket(&self, ticket: oneshot::Receiver<Result<()>>) -> Result<()> {
        ticket
            .await
            .map_err(|_| Error::ChannelNotOpen(self.label.clone()))?
    }

    /// Send a binary message and wait for the transmit result.
    pub async fn send_binary(&self, payload: Bytes) -> Result<()> {
        let ticket = self.enqueue(OutboundPayload::Binary(payload)).await?;
        self.await_ticket(ticket).await
    }

    /// Send a text message and wait for the transmit result.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let ticket = self.enqueue(OutboundPayload::Text(text)).await?;
        self.await_ticket(ticket).await
    }

    /// Serialize a control message and send it, waiting for the result.
    pub async fn send_json<T: serde::Serialize>(&self, msg: &T) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.send_text(json).await
    }

    /// Enqueue a control message without waiting for the transmit result.
    ///
    /// The writer task still logs a failed transmit.
    pub async fn post_json<T: serde::Serialize>(&self, msg: &T) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        let _ticket = self.enqueue(OutboundPayload::Text(json)).await?;
        Ok(())
    }
}
