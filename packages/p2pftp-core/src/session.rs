//! # Session Manager
//!
//! Owns the peer connection, the two data channels, and the session state
//! machine; routes signaling traffic to and from the local channel stack.
//!
//! ```text
//! new ──register──▶ registered ──connect/accept──▶ negotiating
//! negotiating ──(offer+answer+ICE complete)──▶ ice-connected
//! ice-connected ──(both channels open)──▶ channels-open
//! channels-open ──(capabilities exchanged)──▶ ready
//! ready ──close/error──▶ closed          any ──fatal──▶ closed
//! ```
//!
//! Role asymmetry: the initiator creates both channels before generating
//! the offer and buffers its ICE candidates until the responder accepts
//! (emitting them earlier leaks reachability); the responder binds the
//! announced channels by label and sends candidates as they arrive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{rtc::RtcChannel, ChannelEvent, MessageChannel, CONTROL_LABEL, DATA_LABEL};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::event::{CoreEvent, EventSink};
use crate::link::{LinkNotice, PeerLink};
use crate::signaling::{derive_signal_url, SignalMessage, SignalTarget, SignalingClient, SignalingEvent};

/// ICE must reach connected/completed this long after checking starts.
pub const ICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Registered,
    Negotiating,
    IceConnected,
    ChannelsOpen,
    Ready,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::Registered => "registered",
            SessionState::Negotiating => "negotiating",
            SessionState::IceConnected => "ice-connected",
            SessionState::ChannelsOpen => "channels-open",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Outbound ICE candidate gate for the initiator.
///
/// Candidates are held until the responder accepts, then flushed in
/// insertion order. The responder's outbox starts accepted.
#[derive(Debug)]
pub struct IceOutbox {
    accepted: bool,
    buffered: Vec<String>,
}

impl IceOutbox {
    /// An outbox that buffers until [`IceOutbox::accept`].
    pub fn buffering() -> Self {
        Self { accepted: false, buffered: Vec::new() }
    }

    /// An outbox that emits immediately.
    pub fn open() -> Self {
        Self { accepted: true, buffered: Vec::new() }
    }

    /// Offer a candidate: `Some` means emit now, `None` means buffered.
    pub fn push(&mut self, candidate: String) -> Option<String> {
        if self.accepted {
            Some(candidate)
        } else {
            self.buffered.push(candidate);
            None
        }
    }

    /// Mark accepted and drain the buffer in insertion order.
    pub fn accept(&mut self) -> Vec<String> {
        self.accepted = true;
        std::mem::take(&mut self.buffered)
    }
}

#[derive(Default)]
struct PendingChannels {
    control: Option<(Arc<RtcChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>,
    data: Option<(Arc<RtcChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>,
}

struct SessionInner {
    config: SessionConfig,
    events: EventSink,
    state: Mutex<SessionState>,
    target: Mutex<Option<SignalTarget>>,
    signaling: Mutex<Option<SignalingClient>>,
    token: Mutex<Option<String>>,
    peer_token: Mutex<Option<String>>,
    role: Mutex<Option<Role>>,
    ice_outbox: Mutex<IceOutbox>,
    pending_offer: Mutex<Option<String>>,
    pending_request: Mutex<Option<String>>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    link: Mutex<Option<Arc<PeerLink>>>,
    channels: Mutex<Vec<Arc<dyn MessageChannel>>>,
    pending_channels: Mutex<PendingChannels>,
}

/// A peer session: `register`, then exactly one of `connect` or `accept`.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

impl PeerSession {
    /// Create a session; no I/O happens until [`PeerSession::register`].
    pub fn new(config: SessionConfig, events: EventSink) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                events,
                state: Mutex::new(SessionState::New),
                target: Mutex::new(None),
                signaling: Mutex::new(None),
                token: Mutex::new(None),
                peer_token: Mutex::new(None),
                role: Mutex::new(None),
                ice_outbox: Mutex::new(IceOutbox::buffering()),
                pending_offer: Mutex::new(None),
                pending_request: Mutex::new(None),
                pc: Mutex::new(None),
                link: Mutex::new(None),
                channels: Mutex::new(Vec::new()),
                pending_channels: Mutex::new(PendingChannels::default()),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Our token, once registered.
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().clone()
    }

    /// Token carried in the server URL the user supplied, if any.
    pub fn prefill_token(&self) -> Option<String> {
        self.inner.target.lock().as_ref().and_then(|t| t.token.clone())
    }

    /// Token of the peer whose connection request is awaiting `/accept`.
    pub fn pending_request(&self) -> Option<String> {
        self.inner.pending_request.lock().clone()
    }

    /// A shareable connect link: the signaling base URL with our token.
    pub fn share_link(&self) -> Option<String> {
        let token = self.token()?;
        let target = self.inner.target.lock().clone()?;
        let mut url = target.url;
        let scheme = if url.scheme() == "ws" { "http" } else { "https" };
        let _ = url.set_scheme(scheme);
        let path = url.path().trim_end_matches("/signal").to_string();
        url.set_path(if path.is_empty() { "/" } else { path.as_str() });
        url.set_query(Some(&format!("token={token}")));
        Some(url.to_string())
    }

    /// Open the signaling stream and obtain a token. Idempotent.
    pub async fn register(&self) -> Result<String> {
        if let Some(token) = self.token() {
            return Ok(token);
        }

        let target = derive_signal_url(&self.inner.config.server)?;
        *self.inner.target.lock() = Some(target.clone());

        let (client, token, event_rx) = SignalingClient::register(&target).await?;
        *self.inner.signaling.lock() = Some(client);
        *self.inner.token.lock() = Some(token.clone());
        *self.inner.state.lock() = SessionState::Registered;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_signaling_loop(event_rx).await });

        self.inner.events.emit(CoreEvent::TokenAssigned { token: token.clone() });
        self.inner.events.status(format!("registered as {token}"));
        Ok(token)
    }

    /// Dial `peer`: create channels, send the offer, start negotiating.
    pub async fn connect(&self, peer: &str) -> Result<()> {
        self.inner.begin_role(Role::Initiator, peer)?;
        let signaling = self.inner.signaling_handle()?;

        let pc = self.inner.build_peer_connection().await?;

        // Both channels exist before the offer so their descriptions are
        // part of it.
        let control_dc = pc
            .create_data_channel(
                CONTROL_LABEL,
                Some(RTCDataChannelInit { ordered: Some(true), ..Default::default() }),
            )
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let data_dc = pc
            .create_data_channel(
                DATA_LABEL,
                Some(RTCDataChannelInit { ordered: Some(true), ..Default::default() }),
            )
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let control = RtcChannel::bind(control_dc, self.inner.config.low_water).await;
        let data = RtcChannel::bind(data_dc, self.inner.config.low_water).await;
        self.inner.install_link(control, data);

        signaling.send_connect(peer).await?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let sdp = serde_json::to_string(&offer)?;
        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        signaling.send_offer(peer, sdp).await?;

        *self.inner.state.lock() = SessionState::Negotiating;
        self.inner.events.status(format!("connecting to {peer}"));
        Ok(())
    }

    /// Answer `peer`'s request: accept, then apply their offer (which may
    /// have arrived already and been buffered).
    pub async fn accept(&self, peer: &str) -> Result<()> {
        self.inner.begin_role(Role::Responder, peer)?;
        // The responder never buffers its own candidates.
        *self.inner.ice_outbox.lock() = IceOutbox::open();

        let signaling = self.inner.signaling_handle()?;
        let _pc = self.inner.build_peer_connection().await?;

        signaling.send_accept(peer).await?;
        *self.inner.state.lock() = SessionState::Negotiating;
        self.inner.events.status(format!("accepted {peer}"));

        let buffered = self.inner.pending_offer.lock().take();
        if let Some(sdp) = buffered {
            if let Err(e) = self.inner.apply_offer(&sdp).await {
                let e = Error::OfferRejected(e.to_string());
                self.inner.events.error(&e);
                self.inner.close().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// True iff the connection, both channels, and the capability
    /// exchange are all up.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Queue a chat message to the peer.
    pub async fn send_chat(&self, content: &str) -> Result<()> {
        let link = self
            .inner
            .link_handle()
            .ok_or_else(|| Error::InvalidState("not connected to a peer".into()))?;
        link.send_chat(content).await
    }

    /// Start sending a file to the peer.
    pub async fn send_file(&self, path: &Path) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::InvalidState("session is not ready".into()));
        }
        let link = self
            .inner
            .link_handle()
            .ok_or_else(|| Error::InvalidState("not connected to a peer".into()))?;
        link.send_file(path).await
    }

    /// Tear everything down: channels, peer connection, signaling.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl SessionInner {
    fn signaling_handle(&self) -> Result<SignalingClient> {
        self.signaling.lock().clone().ok_or(Error::SignalingClosed)
    }

    fn link_handle(&self) -> Option<Arc<PeerLink>> {
        self.link.lock().clone()
    }

    fn pc_handle(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().clone()
    }

    fn begin_role(&self, role: Role, peer: &str) -> Result<()> {
        let state = *self.state.lock();
        if state != SessionState::Registered {
            return Err(Error::InvalidState(format!(
                "cannot {} while {}",
                match role {
                    Role::Initiator => "connect",
                    Role::Responder => "accept",
                },
                state
            )));
        }
        let mut current = self.role.lock();
        if current.is_some() {
            return Err(Error::InvalidState("already connecting to a peer".into()));
        }
        *current = Some(role);
        *self.peer_token.lock() = Some(peer.to_string());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        let Some(pc) = self.pc_handle() else { return false };
        let Some(link) = self.link_handle() else { return false };
        pc.connection_state() == RTCPeerConnectionState::Connected
            && matches!(
                pc.ice_connection_state(),
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
            )
            && link.is_ready()
    }

    async fn build_peer_connection(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?,
        );

        // Local candidates go through the outbox gate.
        let inner = Arc::clone(self);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => inner.offer_candidate(json).await,
                        Err(e) => warn!(error = %e, "cannot encode ice candidate"),
                    },
                    Err(e) => warn!(error = %e, "cannot serialize ice candidate"),
                }
            })
        }));

        let inner = Arc::clone(self);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.on_ice_state(state) })
        }));

        let inner = Arc::clone(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                debug!(%state, "peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    inner.events.status("peer connection failed".to_string());
                }
            })
        }));

        // The responder's channels arrive in-band; bind by label.
        let inner = Arc::clone(self);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let inner = Arc::clone(&inner);
            Box::pin(async move { inner.adopt_channel(dc).await })
        }));

        *self.pc.lock() = Some(Arc::clone(&pc));
        Ok(pc)
    }

    async fn offer_candidate(&self, candidate: String) {
        let emit = self.ice_outbox.lock().push(candidate);
        let Some(candidate) = emit else {
            debug!("ice candidate buffered until acceptance");
            return;
        };
        self.emit_candidate(candidate).await;
    }

    async fn emit_candidate(&self, candidate: String) {
        let peer = self.peer_token.lock().clone();
        let Some(peer) = peer else { return };
        let Ok(signaling) = self.signaling_handle() else { return };
        if let Err(e) = signaling.send_ice(&peer, candidate).await {
            warn!(error = %e, "failed to relay ice candidate");
        }
    }

    fn on_ice_state(self: &Arc<Self>, state: RTCIceConnectionState) {
        debug!(%state, "ice connection state");
        match state {
            RTCIceConnectionState::Checking => {
                // Watchdog only reports; the stack may still recover.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(ICE_TIMEOUT).await;
                    let Some(pc) = inner.pc_handle() else { return };
                    let settled = matches!(
                        pc.ice_connection_state(),
                        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
                    );
                    if !settled && *inner.state.lock() != SessionState::Closed {
                        inner.events.error(&Error::IceTimeout);
                    }
                });
            }
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                let mut current = self.state.lock();
                if *current == SessionState::Negotiating {
                    *current = SessionState::IceConnected;
                    drop(current);
                    self.events.status("ice connected".to_string());
                }
            }
            RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected => {
                self.events.status(format!("ice state: {state}"));
            }
            _ => {}
        }
    }

    async fn adopt_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        let bound = RtcChannel::bind(dc, self.config.low_water).await;

        let ready = {
            let mut pending = self.pending_channels.lock();
            match label.as_str() {
                CONTROL_LABEL => pending.control = Some(bound),
                DATA_LABEL => pending.data = Some(bound),
                other => {
                    warn!(label = other, "ignoring channel with unknown label");
                    return;
                }
            }
            if pending.control.is_some() && pending.data.is_some() {
                pending.control.take().zip(pending.data.take())
            } else {
                None
            }
        };

        if let Some((control, data)) = ready {
            self.install_link(control, data);
        }
    }

    fn install_link(
        self: &Arc<Self>,
        control: (Arc<RtcChannel>, mpsc::UnboundedReceiver<ChannelEvent>),
        data: (Arc<RtcChannel>, mpsc::UnboundedReceiver<ChannelEvent>),
    ) {
        let (control_ch, control_rx) = control;
        let (data_ch, data_rx) = data;
        {
            let mut channels = self.channels.lock();
            channels.push(control_ch.clone());
            channels.push(data_ch.clone());
        }

        let (link, notice_rx) = PeerLink::new(
            self.config.clone(),
            self.events.clone(),
            control_ch,
            control_rx,
            data_ch,
            data_rx,
        );
        *self.link.lock() = Some(link);

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_notice_loop(notice_rx).await });
    }

    async fn apply_offer(&self, sdp: &str) -> Result<()> {
        let pc = self.pc_handle().ok_or(Error::SessionClosed)?;
        let peer = self
            .peer_token
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("no peer to answer".into()))?;
        let signaling = self.signaling_handle()?;

        let offer: RTCSessionDescription = serde_json::from_str(sdp)?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let answer_sdp = serde_json::to_string(&answer)?;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        signaling.send_answer(&peer, answer_sdp).await?;
        debug!("answer sent");
        Ok(())
    }

    async fn handle_signal(self: &Arc<Self>, msg: SignalMessage) {
        match msg {
            SignalMessage::Request { token } => {
                info!(peer = %token, "incoming connection request");
                *self.pending_request.lock() = Some(token.clone());
                self.events.emit(CoreEvent::PeerRequest { token: token.clone() });
                self.events
                    .status(format!("peer {token} wants to connect; /accept {token}"));
            }
            SignalMessage::Accepted { token } => {
                debug!(peer = %token, "request accepted; flushing ice candidates");
                let buffered = self.ice_outbox.lock().accept();
                for candidate in buffered {
                    self.emit_candidate(candidate).await;
                }
                self.events.status(format!("peer {token} accepted"));
            }
            SignalMessage::Rejected { token } => {
                self.events.error(&Error::PeerRejected(token));
                self.close().await;
            }
            SignalMessage::Offer { sdp, .. } => {
                let ready_to_answer =
                    *self.role.lock() == Some(Role::Responder) && self.pc_handle().is_some();
                if ready_to_answer {
                    if let Err(e) = self.apply_offer(&sdp).await {
                        // An offer we cannot answer ends the session.
                        let e = Error::OfferRejected(e.to_string());
                        self.events.error(&e);
                        self.close().await;
                    }
                } else {
                    // Arrived before the user ran /accept; keep the latest.
                    debug!("buffering offer until acceptance");
                    *self.pending_offer.lock() = Some(sdp);
                }
            }
            SignalMessage::Answer { sdp, .. } => {
                let Some(pc) = self.pc_handle() else { return };
                let applied = match serde_json::from_str::<RTCSessionDescription>(&sdp) {
                    Ok(answer) => pc
                        .set_remote_description(answer)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match applied {
                    Ok(()) => debug!("answer applied"),
                    Err(detail) => {
                        // An answer that does not apply ends the session.
                        let e = Error::OfferRejected(detail);
                        self.events.error(&e);
                        self.close().await;
                    }
                }
            }
            SignalMessage::Ice { ice, .. } => {
                let Some(pc) = self.pc_handle() else { return };
                match serde_json::from_str::<RTCIceCandidateInit>(&ice) {
                    Ok(init) => {
                        if let Err(e) = pc.add_ice_candidate(init).await {
                            warn!(error = %e, "failed to add remote ice candidate");
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable remote ice candidate"),
                }
            }
            SignalMessage::Token { .. } => {
                // The registration path consumed the first token; the
                // protocol never reassigns.
                warn!("ignoring unexpected token message");
            }
            SignalMessage::Connect { .. } | SignalMessage::Accept { .. } => {
                warn!("ignoring client-only message from server");
            }
        }
    }

    async fn run_signaling_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<SignalingEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                SignalingEvent::Message(msg) => self.handle_signal(msg).await,
                SignalingEvent::Closed => {
                    // Advisory once the peers are ready; fatal before.
                    let state = *self.state.lock();
                    if state == SessionState::Ready {
                        self.events
                            .status("signaling connection lost (session unaffected)".to_string());
                    } else if state != SessionState::Closed {
                        self.events.error(&Error::SignalingClosed);
                    }
                    break;
                }
            }
        }
    }

    async fn run_notice_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LinkNotice>) {
        while let Some(notice) = rx.recv().await {
            match notice {
                LinkNotice::ChannelOpen { label } => {
                    debug!(%label, "channel open");
                }
                LinkNotice::ChannelsOpen => {
                    let mut state = self.state.lock();
                    if matches!(*state, SessionState::Negotiating | SessionState::IceConnected) {
                        *state = SessionState::ChannelsOpen;
                    }
                    drop(state);
                    self.events.status("channels open".to_string());
                }
                LinkNotice::CapabilitiesExchanged { .. } => {
                    {
                        let mut state = self.state.lock();
                        if *state == SessionState::ChannelsOpen {
                            *state = SessionState::Ready;
                        }
                    }
                    self.events.status("ready".to_string());
                }
                LinkNotice::ChannelClosed { label } => {
                    debug!(%label, "channel closed");
                    if *self.state.lock() != SessionState::Closed {
                        self.close().await;
                    }
                    break;
                }
                LinkNotice::Fatal(e) => {
                    if e.is_fatal_to_session() && *self.state.lock() != SessionState::Closed {
                        self.close().await;
                    }
                }
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        let link = self.link.lock().take();
        if let Some(link) = link {
            link.abort_transfer();
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            let _ = channel.close().await;
        }
        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!(error = %e, "peer connection close");
            }
        }
        *self.signaling.lock() = None;
        self.events.status("session closed".to_string());
    }
}
