//! Per-viewer negotiation and media session
//!
//! The broadcaster is the designated offerer: a session is created with a
//! rectangle, emits one SDP offer, and walks
//! `Fresh → OfferSent → Answered → Connected`. ICE candidates arriving
//! before the answer land in a bounded queue and are drained onto the peer
//! connection when the remote description is set. Region changes retarget
//! the live cropper (same dimensions) or swap a fresh derived track on the
//! existing sender (new dimensions) without recreating the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::config::{
    DEFAULT_MAX_OUTPUT_FPS, DEFAULT_OFFER_TIMEOUT_SECS, DEFAULT_PENDING_ICE_CAPACITY,
};
use crate::cropper::Cropper;
use crate::error::{AppError, Result};
use crate::geometry::Rectangle;
use crate::messages::ClientMessage;
use crate::registry::types::{ClientId, TransportId};
use crate::webrtc::{build_peer_connection, CroppedVideoTrack, WebRtcConfig};

use super::source::SourceTrack;

/// Negotiation state of one viewer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Fresh,
    OfferSent,
    Answered,
    Connected,
    Failed,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationState::Fresh => write!(f, "fresh"),
            NegotiationState::OfferSent => write!(f, "offer-sent"),
            NegotiationState::Answered => write!(f, "answered"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Failed => write!(f, "failed"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Session events delivered to the owning engine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        client_id: ClientId,
        state: NegotiationState,
    },
    /// No answer arrived within the offer timeout; the engine tears the
    /// session down and recreates it on the next negotiation trigger.
    OfferTimedOut {
        client_id: ClientId,
    },
}

#[derive(Debug, Clone)]
pub struct ViewerSessionConfig {
    pub webrtc: WebRtcConfig,
    pub pending_ice_capacity: usize,
    pub offer_timeout: Duration,
    pub output_fps: u32,
}

impl Default for ViewerSessionConfig {
    fn default() -> Self {
        Self {
            webrtc: WebRtcConfig::default(),
            pending_ice_capacity: DEFAULT_PENDING_ICE_CAPACITY,
            offer_timeout: Duration::from_secs(DEFAULT_OFFER_TIMEOUT_SECS),
            output_fps: DEFAULT_MAX_OUTPUT_FPS,
        }
    }
}

pub struct ViewerSession {
    client_id: ClientId,
    viewer_transport_id: TransportId,
    pc: Arc<RTCPeerConnection>,
    sender: Arc<RTCRtpSender>,
    source: Arc<SourceTrack>,
    track: parking_lot::Mutex<Arc<CroppedVideoTrack>>,
    cropper: parking_lot::Mutex<Arc<Cropper>>,
    track_generation: AtomicU32,
    state_tx: Arc<watch::Sender<NegotiationState>>,
    state_rx: watch::Receiver<NegotiationState>,
    pending_ice: Mutex<VecDeque<Value>>,
    pending_ice_capacity: usize,
    last_answer: Mutex<Option<Value>>,
    output_fps: u32,
    events: mpsc::Sender<SessionEvent>,
    watchdog: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ViewerSession {
    /// Construct a session for one viewer: cropper + peer connection, the
    /// cropped track attached, and the SDP offer handed to the signal path.
    pub async fn create(
        client_id: ClientId,
        viewer_transport_id: TransportId,
        source: Arc<SourceTrack>,
        rect: Rectangle,
        config: ViewerSessionConfig,
        signal_tx: mpsc::Sender<ClientMessage>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        info!(
            client_id = %client_id,
            viewer_transport_id = %viewer_transport_id,
            region = %rect,
            "Creating viewer session"
        );

        let pc = build_peer_connection(&config.webrtc).await?;

        let track = Arc::new(CroppedVideoTrack::new(
            &format!("crop-{}-0", client_id),
            config.output_fps,
        ));
        let cropper = Cropper::bind(
            source.subscribe(),
            rect,
            config.output_fps,
            track.clone() as Arc<dyn crate::cropper::FrameSink>,
        );

        let sender = pc
            .add_track(track.as_track_local())
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add track: {}", e)))?;

        let (state_tx, state_rx) = watch::channel(NegotiationState::Fresh);

        let session = Arc::new(Self {
            client_id,
            viewer_transport_id,
            pc,
            sender,
            source,
            track: parking_lot::Mutex::new(track),
            cropper: parking_lot::Mutex::new(cropper),
            track_generation: AtomicU32::new(0),
            state_tx: Arc::new(state_tx),
            state_rx,
            pending_ice: Mutex::new(VecDeque::new()),
            pending_ice_capacity: config.pending_ice_capacity,
            last_answer: Mutex::new(None),
            output_fps: config.output_fps,
            events,
            watchdog: parking_lot::Mutex::new(None),
        });

        session.setup_peer_handlers(signal_tx.clone());
        session.send_offer(&signal_tx).await?;
        session.spawn_offer_watchdog(config.offer_timeout);

        Ok(session)
    }

    fn setup_peer_handlers(self: &Arc<Self>, signal_tx: mpsc::Sender<ClientMessage>) {
        let state_tx = self.state_tx.clone();
        let events = self.events.clone();
        let client_id = self.client_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state_tx = state_tx.clone();
                let events = events.clone();
                let client_id = client_id.clone();
                Box::pin(async move {
                    let next = match s {
                        RTCPeerConnectionState::Connected => NegotiationState::Connected,
                        RTCPeerConnectionState::Failed => NegotiationState::Failed,
                        _ => return,
                    };
                    let current = *state_tx.borrow();
                    if matches!(
                        current,
                        NegotiationState::Closed | NegotiationState::Failed
                    ) {
                        return;
                    }
                    info!(client_id = %client_id, state = %next, "Viewer session state");
                    let _ = state_tx.send(next);
                    let _ = events
                        .send(SessionEvent::StateChanged {
                            client_id,
                            state: next,
                        })
                        .await;
                })
            }));

        let viewer_transport_id = self.viewer_transport_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let signal_tx = signal_tx.clone();
                let viewer_transport_id = viewer_transport_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize ICE candidate");
                            return;
                        }
                    };
                    if let Ok(value) = serde_json::to_value(&init) {
                        let _ = signal_tx
                            .send(ClientMessage::BroadcasterIceCandidate {
                                viewer_transport_id,
                                candidate: value,
                            })
                            .await;
                    }
                })
            }));
    }

    async fn send_offer(&self, signal_tx: &mpsc::Sender<ClientMessage>) -> Result<()> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                AppError::Negotiation(format!("Failed to set local description: {}", e))
            })?;

        let sdp = serde_json::to_value(&offer)?;
        signal_tx
            .send(ClientMessage::BroadcasterOffer {
                viewer_transport_id: self.viewer_transport_id.clone(),
                sdp,
            })
            .await
            .map_err(|_| AppError::Transport("signal channel closed".to_string()))?;

        let _ = self.state_tx.send(NegotiationState::OfferSent);
        Ok(())
    }

    fn spawn_offer_watchdog(&self, timeout: Duration) {
        let state_rx = self.state_rx.clone();
        let events = self.events.clone();
        let client_id = self.client_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if *state_rx.borrow() == NegotiationState::OfferSent {
                warn!(client_id = %client_id, "Offer unanswered, requesting teardown");
                let _ = events.send(SessionEvent::OfferTimedOut { client_id }).await;
            }
        });
        *self.watchdog.lock() = Some(handle);
    }

    /// Apply the viewer's SDP answer. Accepted only in `OfferSent`; a
    /// duplicate of the already-applied answer is idempotent.
    pub async fn on_answer(&self, sdp: Value) -> Result<()> {
        {
            let last = self.last_answer.lock().await;
            if last.as_ref() == Some(&sdp) {
                debug!(client_id = %self.client_id, "Duplicate answer ignored");
                return Ok(());
            }
        }

        if *self.state_rx.borrow() != NegotiationState::OfferSent {
            warn!(
                client_id = %self.client_id,
                state = %self.state(),
                "Answer arrived in wrong state, dropped"
            );
            return Ok(());
        }

        let description: RTCSessionDescription = serde_json::from_value(sdp.clone())
            .map_err(|e| AppError::BadInput(format!("malformed answer SDP: {}", e)))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| {
                AppError::Negotiation(format!("Failed to set remote description: {}", e))
            })?;
        *self.last_answer.lock().await = Some(sdp);

        self.drain_pending_ice().await;
        let _ = self.state_tx.send(NegotiationState::Answered);
        debug!(client_id = %self.client_id, "Answer applied, pending ICE drained");
        Ok(())
    }

    /// Handle a remote ICE candidate: buffered before the answer, applied
    /// immediately after, dropped in terminal states.
    pub async fn on_remote_ice(&self, candidate: Value) {
        let state = *self.state_rx.borrow();
        match state {
            NegotiationState::Fresh | NegotiationState::OfferSent => {
                let mut pending = self.pending_ice.lock().await;
                pending.push_back(candidate);
                if pending.len() > self.pending_ice_capacity {
                    pending.pop_front();
                    warn!(
                        client_id = %self.client_id,
                        capacity = self.pending_ice_capacity,
                        "Pending ICE queue full, dropped oldest candidate"
                    );
                }
            }
            NegotiationState::Answered | NegotiationState::Connected => {
                self.apply_ice(candidate).await;
            }
            state => {
                debug!(client_id = %self.client_id, %state, "ICE candidate dropped");
            }
        }
    }

    async fn drain_pending_ice(&self) {
        let drained: Vec<Value> = self.pending_ice.lock().await.drain(..).collect();
        for candidate in drained {
            self.apply_ice(candidate).await;
        }
    }

    async fn apply_ice(&self, candidate: Value) {
        let init: RTCIceCandidateInit = match serde_json::from_value(candidate) {
            Ok(init) => init,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "Malformed ICE candidate dropped");
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!(client_id = %self.client_id, error = %e, "Failed to add ICE candidate");
        }
    }

    /// Hot region re-bind. Same dimensions: retarget the live cropper, no
    /// track replacement, no renegotiation. New dimensions: bind a fresh
    /// cropper + track and swap it on the existing sender; the wire format
    /// is unchanged and the session stays connected.
    pub async fn on_region_change(&self, rect: Rectangle) -> Result<()> {
        let current = self.cropper.lock().rect();
        if rect.same_dimensions(&current) {
            self.cropper.lock().retarget(rect);
            debug!(client_id = %self.client_id, region = %rect, "Cropper retargeted");
            return Ok(());
        }

        let generation = self.track_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let new_track = Arc::new(CroppedVideoTrack::new(
            &format!("crop-{}-{}", self.client_id, generation),
            self.output_fps,
        ));
        let new_cropper = Cropper::bind(
            self.source.subscribe(),
            rect,
            self.output_fps,
            new_track.clone() as Arc<dyn crate::cropper::FrameSink>,
        );

        if let Err(e) = self.sender.replace_track(Some(new_track.as_track_local())).await {
            new_cropper.close();
            return Err(AppError::Negotiation(format!(
                "Track replacement failed: {}",
                e
            )));
        }

        let old_cropper = {
            let mut track = self.track.lock();
            let mut cropper = self.cropper.lock();
            *track = new_track;
            std::mem::replace(&mut *cropper, new_cropper)
        };
        old_cropper.close();

        info!(client_id = %self.client_id, region = %rect, "Derived track replaced");
        Ok(())
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<NegotiationState> {
        self.state_rx.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn viewer_transport_id(&self) -> &str {
        &self.viewer_transport_id
    }

    pub fn region(&self) -> Rectangle {
        self.cropper.lock().rect()
    }

    /// Idempotent teardown: stop the cropper, close the peer connection,
    /// clear pending ICE.
    pub async fn close(&self) {
        if *self.state_rx.borrow() == NegotiationState::Closed {
            return;
        }
        let _ = self.state_tx.send(NegotiationState::Closed);

        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
        self.cropper.lock().close();
        self.pending_ice.lock().await.clear();

        if let Err(e) = self.pc.close().await {
            warn!(client_id = %self.client_id, error = %e, "Peer connection close failed");
        }
        info!(client_id = %self.client_id, "Viewer session closed");
    }

    #[cfg(test)]
    async fn pending_ice_len(&self) -> usize {
        self.pending_ice.lock().await.len()
    }
}
