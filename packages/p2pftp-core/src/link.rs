//! # Peer Link
//!
//! The channel-level runtime for one peer: both channel writers, the
//! capability negotiation state, and the single transfer slot. The
//! session manager layers connection state on top; the tests drive a
//! [`PeerLink`] directly over in-process channels.
//!
//! One reader loop per channel. The control loop is the dispatcher: it
//! parses JSON, switches on `type`, and routes; the data loop feeds raw
//! frames to the active receiving transfer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{ChannelEvent, ChannelWriter, MessageChannel};
use crate::config::{negotiate_chunk_size, SessionConfig};
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::event::{CoreEvent, EventSink};
use crate::transfer::receiver::{ReceiverInput, ReceiverParams};
use crate::transfer::sender::{describe_file, SenderParams};
use crate::transfer::{self, payload_size};

/// Delay between the control channel opening and our capability
/// announcement, letting the stack settle.
pub const CAPABILITY_ANNOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Capability exchange must complete this long after our announcement.
pub const CAPABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Link-level notifications consumed by the session manager.
#[derive(Debug)]
pub enum LinkNotice {
    /// One channel reported open.
    ChannelOpen { label: String },
    /// Both channels are open.
    ChannelsOpen,
    /// Capability exchange completed; the chunk size is fixed.
    CapabilitiesExchanged { chunk_size: u32 },
    /// A channel closed.
    ChannelClosed { label: String },
    /// The link is unusable; the session should close.
    Fatal(Error),
}

#[derive(Debug)]
struct CapabilityState {
    local_max: u32,
    negotiated: Option<u32>,
    exchanged: bool,
    announce_started: bool,
}

enum TransferSlot {
    Idle,
    /// Reserved while the outgoing file is being hashed.
    Preparing,
    Sending {
        missing_tx: mpsc::UnboundedSender<Vec<u32>>,
        /// Primary pass done; a new send may preempt the recovery linger.
        settled: Arc<std::sync::atomic::AtomicBool>,
    },
    Receiving { input_tx: mpsc::UnboundedSender<ReceiverInput> },
}

struct OpenFlags {
    control: bool,
    data: bool,
}

/// The two-channel runtime for one connected peer.
pub struct PeerLink {
    config: SessionConfig,
    events: EventSink,
    control: ChannelWriter,
    data: ChannelWriter,
    caps: Mutex<CapabilityState>,
    transfer: Mutex<TransferSlot>,
    open: Mutex<OpenFlags>,
    notices: mpsc::UnboundedSender<LinkNotice>,
}

impl PeerLink {
    /// Build the link and spawn its reader loops.
    pub fn new(
        config: SessionConfig,
        events: EventSink,
        control: Arc<dyn MessageChannel>,
        control_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        data: Arc<dyn MessageChannel>,
        data_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkNotice>) {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let high_water = config.high_water;
        let local_max = config.max_chunk_size;

        let link = Arc::new(Self {
            config,
            events,
            control: ChannelWriter::spawn(control, high_water),
            data: ChannelWriter::spawn(data, high_water),
            caps: Mutex::new(CapabilityState {
                local_max,
                negotiated: None,
                exchanged: false,
                announce_started: false,
            }),
            transfer: Mutex::new(TransferSlot::Idle),
            open: Mutex::new(OpenFlags { control: false, data: false }),
            notices: notice_tx,
        });

        let control_link = Arc::clone(&link);
        tokio::spawn(async move { control_link.run_control_loop(control_rx).await });
        let data_link = Arc::clone(&link);
        tokio::spawn(async move { data_link.run_data_loop(data_rx).await });

        (link, notice_rx)
    }

    fn notify(&self, notice: LinkNotice) {
        let _ = self.notices.send(notice);
    }

    /// The negotiated chunk size, once capabilities are exchanged.
    pub fn negotiated_chunk_size(&self) -> Option<u32> {
        self.caps.lock().negotiated
    }

    /// File bytes per frame, once capabilities are exchanged.
    pub fn negotiated_payload(&self) -> Option<u32> {
        self.negotiated_chunk_size().map(payload_size)
    }

    /// Whether both channels are open and capabilities are exchanged.
    pub fn is_ready(&self) -> bool {
        let open = self.open.lock();
        open.control && open.data && self.caps.lock().exchanged
    }

    /// Queue a chat message; transmit errors surface via the writer log
    /// and the channel's error event.
    pub async fn send_chat(&self, content: &str) -> Result<()> {
        self.control
            .post_json(&ControlMessage::Message { content: content.to_string() })
            .await
    }

    /// Start sending `path` to the peer. Returns once the transfer is
    /// announced; progress and completion arrive as events.
    pub async fn send_file(self: &Arc<Self>, path: &Path) -> Result<()> {
        let chunk_size = self
            .negotiated_chunk_size()
            .ok_or_else(|| Error::InvalidState("capabilities not yet negotiated".into()))?;
        {
            let mut slot = self.transfer.lock();
            let free = match &*slot {
                TransferSlot::Idle => true,
                // A sender that has finished its primary pass only lingers
                // for missing-chunks requests; replacing it drops its
                // request channel and the old task retires.
                TransferSlot::Sending { settled, .. } => {
                    settled.load(std::sync::atomic::Ordering::SeqCst)
                }
                _ => false,
            };
            if !free {
                return Err(Error::InvalidState("a transfer is already active".into()));
            }
            *slot = TransferSlot::Preparing;
        }

        let payload = payload_size(chunk_size);
        let (file, info) = match describe_file(path, payload).await {
            Ok(described) => described,
            Err(e) => {
                *self.transfer.lock() = TransferSlot::Idle;
                return Err(e);
            }
        };

        let (missing_tx, missing_rx) = mpsc::unbounded_channel();
        let settled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        *self.transfer.lock() = TransferSlot::Sending {
            missing_tx,
            settled: Arc::clone(&settled),
        };

        self.events.status(format!(
            "sending {} ({} bytes, {} chunks)",
            info.name, info.size, info.chunks
        ));

        let params = SenderParams {
            file,
            info,
            payload_size: payload,
            window: self.config.window,
            control: self.control.clone(),
            data: self.data.clone(),
            events: self.events.clone(),
            settled: Arc::clone(&settled),
        };
        let link = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transfer::run_sender(params, missing_rx).await {
                link.events.error(&e);
            }
            link.release_sender(&settled);
        });
        Ok(())
    }

    /// Free the slot if it still belongs to the sender that owns `mark`
    /// (a preempting transfer may have taken it already).
    fn release_sender(&self, mark: &Arc<std::sync::atomic::AtomicBool>) {
        let mut slot = self.transfer.lock();
        if let TransferSlot::Sending { settled, .. } = &*slot {
            if Arc::ptr_eq(settled, mark) {
                *slot = TransferSlot::Idle;
            }
        }
    }

    fn release_receiver(&self, mark: &mpsc::UnboundedSender<ReceiverInput>) {
        let mut slot = self.transfer.lock();
        if let TransferSlot::Receiving { input_tx } = &*slot {
            if input_tx.same_channel(mark) {
                *slot = TransferSlot::Idle;
            }
        }
    }

    /// Drop any active transfer; its tasks see closed channels and stop.
    pub fn abort_transfer(&self) {
        *self.transfer.lock() = TransferSlot::Idle;
    }

    // ── Capability negotiation ──────────────────────────────────────────

    fn mark_open(self: &Arc<Self>, label: &str) {
        let both = {
            let mut open = self.open.lock();
            if label == self.control.label() {
                open.control = true;
            } else {
                open.data = true;
            }
            open.control && open.data
        };
        self.notify(LinkNotice::ChannelOpen { label: label.to_string() });
        if both {
            self.notify(LinkNotice::ChannelsOpen);
            self.start_capability_exchange();
        }
    }

    fn start_capability_exchange(self: &Arc<Self>) {
        {
            let mut caps = self.caps.lock();
            if caps.announce_started {
                return;
            }
            caps.announce_started = true;
        }

        let link = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(CAPABILITY_ANNOUNCE_DELAY).await;
            let local_max = link.caps.lock().local_max;
            if let Err(e) = link
                .control
                .send_json(&ControlMessage::Capabilities { max_chunk_size: local_max })
                .await
            {
                link.events.error(&e);
                link.notify(LinkNotice::Fatal(e));
                return;
            }
            debug!(max_chunk_size = local_max, "capabilities announced");

            tokio::time::sleep(CAPABILITY_TIMEOUT).await;
            if !link.caps.lock().exchanged {
                let e = Error::CapabilitiesTimeout;
                link.events.error(&e);
                link.notify(LinkNotice::Fatal(e));
            }
        });
    }

    fn mark_exchanged(&self, chunk_size: u32) {
        let newly = {
            let mut caps = self.caps.lock();
            let newly = !caps.exchanged;
            caps.exchanged = true;
            newly
        };
        if newly {
            self.notify(LinkNotice::CapabilitiesExchanged { chunk_size });
            self.events
                .status(format!("negotiated chunk size: {chunk_size} bytes"));
        }
    }

    async fn handle_capabilities(&self, peer_max: u32) {
        let negotiated = {
            let mut caps = self.caps.lock();
            // The size is fixed once negotiated; repeated announcements
            // get the same ack back.
            let negotiated = match caps.negotiated {
                Some(existing) => existing,
                None => {
                    let negotiated = negotiate_chunk_size(caps.local_max, peer_max);
                    caps.negotiated = Some(negotiated);
                    negotiated
                }
            };
            negotiated
        };

        if let Err(e) = self
            .control
            .post_json(&ControlMessage::CapabilitiesAck { negotiated_chunk_size: negotiated })
            .await
        {
            warn!(error = %e, "failed to queue capabilities-ack");
            return;
        }
        // Exchanged once the ack is sent.
        self.mark_exchanged(negotiated);
    }

    fn handle_capabilities_ack(&self, negotiated: u32) {
        let chunk_size = {
            let mut caps = self.caps.lock();
            let clamped = crate::config::clamp_chunk_size(negotiated);
            *caps.negotiated.get_or_insert(clamped)
        };
        self.mark_exchanged(chunk_size);
    }

    // ── Inbound transfer ────────────────────────────────────────────────

    fn handle_file_info(self: &Arc<Self>, info: transfer::FileInfo) {
        let payload = match self.negotiated_payload() {
            Some(payload) => payload,
            None => {
                let e = Error::InvalidState("file-info before capability exchange".into());
                self.events.error(&e);
                return;
            }
        };

        let name = match Path::new(&info.name).file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let e = Error::TransferFailed(format!("unusable filename {:?}", info.name));
                self.events.error(&e);
                return;
            }
        };
        let dest = self.config.download_dir.join(name);

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mark = input_tx.clone();
        {
            let mut slot = self.transfer.lock();
            if !matches!(*slot, TransferSlot::Idle) {
                let e = Error::InvalidState("peer announced a file mid-transfer".into());
                self.events.error(&e);
                return;
            }
            *slot = TransferSlot::Receiving { input_tx };
        }

        let params = ReceiverParams {
            info,
            dest,
            payload_size: payload,
            control: self.control.clone(),
            events: self.events.clone(),
        };
        let link = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = transfer::run_receiver(params, input_rx).await {
                link.events.error(&e);
            }
            link.release_receiver(&mark);
        });
    }

    fn route_to_receiver(&self, input: ReceiverInput) {
        let slot = self.transfer.lock();
        match &*slot {
            TransferSlot::Receiving { input_tx } => {
                let _ = input_tx.send(input);
            }
            _ => debug!("no receiving transfer for {:?}", input),
        }
    }

    fn route_missing_chunks(&self, sequences: Vec<u32>) {
        let slot = self.transfer.lock();
        match &*slot {
            TransferSlot::Sending { missing_tx, .. } => {
                let _ = missing_tx.send(sequences);
            }
            _ => warn!("missing-chunks with no sending transfer"),
        }
    }

    // ── Reader loops ────────────────────────────────────────────────────

    async fn run_control_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Open => self.mark_open(self.control.label()),
                ChannelEvent::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(ControlMessage::Capabilities { max_chunk_size }) => {
                        self.handle_capabilities(max_chunk_size).await;
                    }
                    Ok(ControlMessage::CapabilitiesAck { negotiated_chunk_size }) => {
                        self.handle_capabilities_ack(negotiated_chunk_size);
                    }
                    Ok(ControlMessage::Message { content }) => self.events.chat(content),
                    Ok(ControlMessage::FileInfo { name, size, md5, chunks }) => {
                        self.handle_file_info(transfer::FileInfo { name, size, md5, chunks });
                    }
                    Ok(ControlMessage::FileComplete) => {
                        self.route_to_receiver(ReceiverInput::Complete);
                    }
                    Ok(ControlMessage::MissingChunks { sequences }) => {
                        self.route_missing_chunks(sequences);
                    }
                    Err(e) => {
                        debug!(error = %e, "undecodable control message to generic sink");
                        self.events.emit(CoreEvent::RawControl {
                            payload: Bytes::from(text.into_bytes()),
                        });
                    }
                },
                ChannelEvent::Binary(payload) => {
                    warn!(len = payload.len(), "binary frame on control channel");
                    self.events.emit(CoreEvent::RawControl { payload });
                }
                ChannelEvent::Error(detail) => {
                    warn!(channel = self.control.label(), %detail, "channel error");
                }
                ChannelEvent::Closed => {
                    self.abort_transfer();
                    self.notify(LinkNotice::ChannelClosed {
                        label: self.control.label().to_string(),
                    });
                    break;
                }
            }
        }
    }

    async fn run_data_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ChannelEvent::Open => self.mark_open(self.data.label()),
                ChannelEvent::Binary(frame) => {
                    self.route_to_receiver(ReceiverInput::Frame(frame));
                }
                ChannelEvent::Text(text) => {
                    warn!(len = text.len(), "text frame on data channel dropped");
                }
                ChannelEvent::Error(detail) => {
                    warn!(channel = self.data.label(), %detail, "channel error");
                }
                ChannelEvent::Closed => {
                    self.abort_transfer();
                    self.notify(LinkNotice::ChannelClosed {
                        label: self.data.label().to_string(),
                    });
                    break;
                }
            }
        }
    }
}
