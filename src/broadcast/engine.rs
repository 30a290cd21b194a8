//! Broadcaster engine
//!
//! Registers as the broadcaster participant and drives viewer sessions from
//! hub notifications: `new-viewer` plus an assigned region creates a
//! session, `client-region-updated` re-binds it live, `viewer-answer` and
//! `viewer-ice-candidate` feed its negotiation machine, and
//! `viewer-disconnected` destroys it. A destroyed session is always
//! recreated from scratch on the next rendezvous; peer connections are
//! never reused across viewer reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hub::dispatch;
use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::types::{ClientId, TransportId};
use crate::state::AppState;

use super::session::{NegotiationState, SessionEvent, ViewerSession, ViewerSessionConfig};
use super::source::SourceTrack;

/// Capacity of the engine's internal session event channel
const SESSION_EVENT_CAPACITY: usize = 64;
/// Capacity of the in-process participant channel toward the hub
const SIGNAL_CAPACITY: usize = 64;

/// Shared view of the engine's live sessions
#[derive(Clone, Default)]
pub struct EngineHandle {
    sessions: Arc<RwLock<HashMap<ClientId, Arc<ViewerSession>>>>,
}

impl EngineHandle {
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_state(&self, client_id: &str) -> Option<NegotiationState> {
        self.sessions.read().get(client_id).map(|s| s.state())
    }

    fn insert(&self, client_id: ClientId, session: Arc<ViewerSession>) {
        self.sessions.write().insert(client_id, session);
    }

    fn remove(&self, client_id: &str) -> Option<Arc<ViewerSession>> {
        self.sessions.write().remove(client_id)
    }

    fn get(&self, client_id: &str) -> Option<Arc<ViewerSession>> {
        self.sessions.read().get(client_id).cloned()
    }

    fn drain(&self) -> Vec<Arc<ViewerSession>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }
}

pub struct BroadcastEngine {
    source: Arc<SourceTrack>,
    config: ViewerSessionConfig,
    signal_tx: mpsc::Sender<ClientMessage>,
    sessions: EngineHandle,
    /// viewer clientId → current viewer transport
    transports: HashMap<ClientId, TransportId>,
    by_transport: HashMap<TransportId, ClientId>,
    regions: HashMap<ClientId, crate::geometry::Rectangle>,
    session_events_tx: mpsc::Sender<SessionEvent>,
}

impl BroadcastEngine {
    /// Spawn the engine over an already-established message channel pair.
    pub fn spawn(
        source: Arc<SourceTrack>,
        config: ViewerSessionConfig,
        signal_tx: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<ServerMessage>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (session_events_tx, session_events_rx) = mpsc::channel(SESSION_EVENT_CAPACITY);
        let handle = EngineHandle::default();
        let engine = Self {
            source,
            config,
            signal_tx,
            sessions: handle.clone(),
            transports: HashMap::new(),
            by_transport: HashMap::new(),
            regions: HashMap::new(),
            session_events_tx,
        };
        let task = tokio::spawn(engine.run(inbound, session_events_rx));
        (handle, task)
    }

    /// Attach an engine to the hub as an in-process participant with the
    /// same semantics as a WebSocket transport.
    pub fn attach_in_process(
        state: Arc<AppState>,
        source: Arc<SourceTrack>,
        config: ViewerSessionConfig,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (transport_id, server_rx) = state.hub.attach();
        let (client_tx, mut client_rx) = mpsc::channel::<ClientMessage>(SIGNAL_CAPACITY);

        // Pump engine-originated messages through the same dispatch boundary
        // a WebSocket participant would use.
        let pump_state = state.clone();
        let pump_transport = transport_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = client_rx.recv().await {
                dispatch::handle_message(&pump_state, &pump_transport, msg).await;
            }
            dispatch::handle_disconnect(&pump_state, &pump_transport).await;
        });

        Self::spawn(source, config, client_tx, server_rx)
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<ServerMessage>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        let geometry = self.source.geometry();
        if self
            .signal_tx
            .send(ClientMessage::RegisterBroadcaster { geometry })
            .await
            .is_err()
        {
            warn!("Signal channel closed before broadcaster registration");
            return;
        }
        info!(%geometry, "Broadcast engine registered");

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle_server_message(msg).await,
                        // Hub closed the transport (e.g. replaced by a newer
                        // broadcaster); every session dies with it.
                        None => break,
                    }
                }
                event = session_events.recv() => {
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => break,
                    }
                }
            }
        }

        for session in self.sessions.drain() {
            session.close().await;
        }
        info!("Broadcast engine stopped");
    }

    async fn handle_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::NewViewer {
                viewer_transport_id,
                client_id,
            } => {
                debug!(client_id = %client_id, "Viewer available");
                self.by_transport
                    .insert(viewer_transport_id.clone(), client_id.clone());
                self.transports.insert(client_id.clone(), viewer_transport_id);
                if self.regions.contains_key(&client_id) {
                    self.rebuild_session(&client_id).await;
                }
            }
            ServerMessage::ClientRegionUpdated { client_id, region } => {
                match region {
                    Some(rect) => {
                        self.regions.insert(client_id.clone(), rect);
                        if let Some(session) = self.sessions.get(&client_id) {
                            if let Err(e) = session.on_region_change(rect).await {
                                // Catastrophic re-bind failure: start over
                                // from Fresh.
                                warn!(client_id = %client_id, error = %e, "Region re-bind failed, recreating session");
                                self.rebuild_session(&client_id).await;
                            }
                        } else if self.transports.contains_key(&client_id) {
                            self.rebuild_session(&client_id).await;
                        }
                    }
                    None => {
                        // Unassigned viewers get no track, idle screen only.
                        self.regions.remove(&client_id);
                        self.destroy_session(&client_id).await;
                    }
                }
            }
            ServerMessage::ViewerAnswer {
                viewer_transport_id,
                sdp,
            } => {
                let Some(session) = self.session_by_transport(&viewer_transport_id) else {
                    warn!(viewer_transport_id = %viewer_transport_id, "Answer for unknown session dropped");
                    return;
                };
                if let Err(e) = session.on_answer(sdp).await {
                    warn!(error = %e, "Answer rejected, recreating session");
                    let client_id = session.client_id().to_string();
                    self.rebuild_session(&client_id).await;
                }
            }
            ServerMessage::ViewerIceCandidate {
                viewer_transport_id,
                candidate,
            } => {
                if let Some(session) = self.session_by_transport(&viewer_transport_id) {
                    session.on_remote_ice(candidate).await;
                }
            }
            ServerMessage::ViewerDisconnected {
                viewer_transport_id,
            } => {
                if let Some(client_id) = self.by_transport.remove(&viewer_transport_id) {
                    self.transports.remove(&client_id);
                    // Region assignment survives in the registry; only the
                    // media session dies.
                    self.destroy_session(&client_id).await;
                }
            }
            other => {
                debug!(message = ?other, "Engine ignoring hub message");
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged {
                client_id,
                state: NegotiationState::Failed,
            } => {
                warn!(client_id = %client_id, "Session failed, tearing down");
                self.destroy_session(&client_id).await;
            }
            SessionEvent::OfferTimedOut { client_id } => {
                self.destroy_session(&client_id).await;
            }
            SessionEvent::StateChanged { client_id, state } => {
                debug!(client_id = %client_id, %state, "Session state change");
            }
        }
    }

    fn session_by_transport(&self, viewer_transport_id: &str) -> Option<Arc<ViewerSession>> {
        let client_id = self.by_transport.get(viewer_transport_id)?;
        self.sessions.get(client_id)
    }

    /// Tear down any existing session and build a fresh one when both a
    /// transport and a region are known. New sessions always start from
    /// `Fresh`.
    async fn rebuild_session(&mut self, client_id: &str) {
        self.destroy_session(client_id).await;

        let (Some(rect), Some(transport)) = (
            self.regions.get(client_id).copied(),
            self.transports.get(client_id).cloned(),
        ) else {
            return;
        };

        match ViewerSession::create(
            client_id.to_string(),
            transport,
            self.source.clone(),
            rect,
            self.config.clone(),
            self.signal_tx.clone(),
            self.session_events_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                self.sessions.insert(client_id.to_string(), session);
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Failed to create viewer session");
            }
        }
    }

    async fn destroy_session(&mut self, client_id: &str) {
        if let Some(session) = self.sessions.remove(client_id) {
            session.close().await;
        }
    }
}
