//! Signal router: per-message forwarding of SDP and ICE payloads
//!
//! The router addresses messages by viewer transport identity and never
//! looks inside SDP or candidate payloads. Messages referencing an absent
//! or disconnected counterparty are dropped with a warning, never queued;
//! the negotiation state machine recovers by emitting a fresh offer on the
//! next re-attach.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::hub::{EventHub, ParticipantRole};
use crate::messages::ServerMessage;
use crate::registry::RegistryHandle;

pub struct SignalRouter {
    registry: RegistryHandle,
    hub: Arc<EventHub>,
}

impl SignalRouter {
    pub fn new(registry: RegistryHandle, hub: Arc<EventHub>) -> Arc<Self> {
        Arc::new(Self { registry, hub })
    }

    fn viewer_attached(&self, viewer_transport_id: &str) -> bool {
        matches!(
            self.hub.role(viewer_transport_id),
            Some(ParticipantRole::Viewer(_))
        )
    }

    /// Forward a broadcaster's SDP offer to the addressed viewer.
    pub fn offer_to_viewer(&self, viewer_transport_id: &str, sdp: Value) {
        if !self.viewer_attached(viewer_transport_id) {
            warn!(
                viewer_transport_id = %viewer_transport_id,
                "Dropping offer for absent viewer"
            );
            return;
        }
        self.hub
            .send_to(viewer_transport_id, ServerMessage::BroadcasterOffer { sdp });
    }

    /// Forward a viewer's SDP answer to the current broadcaster, tagged with
    /// the viewer's transport id.
    pub async fn answer_to_broadcaster(&self, viewer_transport_id: &str, sdp: Value) {
        if !self.broadcaster_present().await {
            warn!(
                viewer_transport_id = %viewer_transport_id,
                "Dropping answer, no broadcaster attached"
            );
            return;
        }
        self.hub.send_to_broadcaster(ServerMessage::ViewerAnswer {
            viewer_transport_id: viewer_transport_id.to_string(),
            sdp,
        });
    }

    /// Forward a broadcaster-originated ICE candidate to the addressed viewer.
    pub fn ice_to_viewer(&self, viewer_transport_id: &str, candidate: Value) {
        if !self.viewer_attached(viewer_transport_id) {
            warn!(
                viewer_transport_id = %viewer_transport_id,
                "Dropping ICE candidate for absent viewer"
            );
            return;
        }
        self.hub.send_to(
            viewer_transport_id,
            ServerMessage::BroadcasterIceCandidate { candidate },
        );
    }

    /// Forward a viewer-originated ICE candidate to the current broadcaster.
    pub async fn ice_to_broadcaster(&self, viewer_transport_id: &str, candidate: Value) {
        if !self.broadcaster_present().await {
            warn!(
                viewer_transport_id = %viewer_transport_id,
                "Dropping ICE candidate, no broadcaster attached"
            );
            return;
        }
        self.hub
            .send_to_broadcaster(ServerMessage::ViewerIceCandidate {
                viewer_transport_id: viewer_transport_id.to_string(),
                candidate,
            });
    }

    async fn broadcaster_present(&self) -> bool {
        self.registry
            .broadcaster_transport()
            .await
            .ok()
            .flatten()
            .is_some()
    }
}
