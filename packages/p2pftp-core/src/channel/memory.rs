//! # In-Process Channel Pair
//!
//! A loopback [`MessageChannel`] implementation used by the test suite.
//! Delivery is ordered and reliable by default; a per-endpoint fault hook
//! can drop or rewrite outbound binary frames to exercise the transfer
//! engine's recovery paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ChannelEvent, MessageChannel};
use crate::error::{Error, Result};

/// What to do with one outbound binary frame.
pub enum Fault {
    /// Deliver unchanged.
    Deliver,
    /// Swallow the frame; the peer never sees it.
    Drop,
    /// Deliver a different frame instead.
    Replace(Bytes),
}

/// Inspects each outbound binary frame and picks its fate.
pub type FaultHook = Box<dyn FnMut(&Bytes) -> Fault + Send>;

/// One endpoint of an in-process channel pair.
pub struct MemoryChannel {
    label: String,
    open: Arc<AtomicBool>,
    to_peer: mpsc::UnboundedSender<ChannelEvent>,
    to_self: mpsc::UnboundedSender<ChannelEvent>,
    fault: Mutex<Option<FaultHook>>,
}

/// Build a connected pair. Both endpoints report open immediately and an
/// `Open` event is already queued on each receiver.
pub fn pair(
    label: &str,
) -> (
    Arc<MemoryChannel>,
    mpsc::UnboundedReceiver<ChannelEvent>,
    Arc<MemoryChannel>,
    mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let _ = a_tx.send(ChannelEvent::Open);
    let _ = b_tx.send(ChannelEvent::Open);

    let a = Arc::new(MemoryChannel {
        label: label.to_string(),
        open: Arc::clone(&open),
        to_peer: b_tx.clone(),
        to_self: a_tx.clone(),
        fault: Mutex::new(None),
    });
    let b = Arc::new(MemoryChannel {
        label: label.to_string(),
        open,
        to_peer: a_tx,
        to_self: b_tx,
        fault: Mutex::new(None),
    });

    (a, a_rx, b, b_rx)
}

impl MemoryChannel {
    /// Install a fault hook for outbound binary frames.
    pub fn set_binary_fault(&self, hook: FaultHook) {
        *self.fault.lock() = Some(hook);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ChannelNotOpen(self.label.clone()))
        }
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.ensure_open()?;
        self.to_peer
            .send(ChannelEvent::Text(text))
            .map_err(|_| Error::ChannelNotOpen(self.label.clone()))
    }

    async fn send_binary(&self, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        let outcome = match self.fault.lock().as_mut() {
            Some(hook) => hook(&payload),
            None => Fault::Deliver,
        };
        let delivered = match outcome {
            Fault::Deliver => payload,
            Fault::Drop => return Ok(()),
            Fault::Replace(other) => other,
        };
        self.to_peer
            .send(ChannelEvent::Binary(delivered))
            .map_err(|_| Error::ChannelNotOpen(self.label.clone()))
    }

    async fn wait_buffered_low(&self) {}

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.to_peer.send(ChannelEvent::Closed);
            let _ = self.to_self.send(ChannelEvent::Closed);
        }
        Ok(())
    }
}
