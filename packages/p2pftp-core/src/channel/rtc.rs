//! # WebRTC Channel Binding
//!
//! Adapts an [`RTCDataChannel`] to the [`MessageChannel`] trait: callbacks
//! become an ordered event stream, and the buffered-amount-low callback
//! feeds the backpressure wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use super::{ChannelEvent, MessageChannel};
use crate::error::{Error, Result};
use crate::framing::MAX_CHUNK_SIZE;

/// A [`MessageChannel`] backed by a live `RTCDataChannel`.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    low_water: usize,
    drained: Arc<Notify>,
}

impl RtcChannel {
    /// Register callbacks on `dc` and return the channel plus its event
    /// stream. Call once per data channel.
    pub async fn bind(
        dc: Arc<RTCDataChannel>,
        low_water: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let drained = Arc::new(Notify::new());

        let open_tx = tx.clone();
        dc.on_open(Box::new(move || {
            let _ = open_tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }));

        let msg_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let event = if msg.is_string {
                match std::str::from_utf8(&msg.data) {
                    Ok(text) => ChannelEvent::Text(text.to_string()),
                    // A text frame that is not UTF-8 reaches the generic
                    // sink as bytes.
                    Err(_) => ChannelEvent::Binary(msg.data.clone()),
                }
            } else {
                ChannelEvent::Binary(msg.data.clone())
            };
            let _ = msg_tx.send(event);
            Box::pin(async {})
        }));

        let close_tx = tx.clone();
        dc.on_close(Box::new(move || {
            let _ = close_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let error_tx = tx;
        dc.on_error(Box::new(move |e| {
            let _ = error_tx.send(ChannelEvent::Error(e.to_string()));
            Box::pin(async {})
        }));

        dc.set_buffered_amount_low_threshold(low_water).await;
        let drained_cb = Arc::clone(&drained);
        dc.on_buffered_amount_low(Box::new(move || {
            let drained = Arc::clone(&drained_cb);
            Box::pin(async move {
                drained.notify_waiters();
            })
        }))
        .await;

        let label = dc.label().to_string();
        (
            Arc::new(Self { dc, label, low_water, drained }),
            rx,
        )
    }

    fn map_send_error(&self, e: webrtc::Error) -> Error {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            Error::ChannelNotOpen(self.label.clone())
        } else {
            Error::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl MessageChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelNotOpen(self.label.clone()));
        }
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| self.map_send_error(e))
    }

    async fn send_binary(&self, payload: Bytes) -> Result<()> {
        if payload.len() > MAX_CHUNK_SIZE as usize {
            return Err(Error::DataSizeExceeded {
                len: payload.len(),
                max: MAX_CHUNK_SIZE as usize,
            });
        }
        if !self.is_open() {
            return Err(Error::ChannelNotOpen(self.label.clone()));
        }
        self.dc
            .send(&payload)
            .await
            .map(|_| ())
            .map_err(|e| self.map_send_error(e))
    }

    async fn wait_buffered_low(&self) {
        // Re-check periodically: the low event may have fired between the
        // caller's buffered_amount check and our registration.
        loop {
            if self.dc.buffered_amount().await <= self.low_water {
                return;
            }
            let notified = self.drained.notified();
            tokio::select! {
                _ = notified => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.dc
            .close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
