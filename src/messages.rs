//! Wire messages exchanged between the hub and its participants
//!
//! Every message is a JSON object with a `type` discriminator. SDP and ICE
//! payloads are carried as opaque JSON values: the hub forwards them without
//! interpretation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::geometry::{RawRect, Rectangle, StreamGeometry};
use crate::registry::types::{ClientId, TransportId, ViewerRecord};

/// Distinguishes an absent `region` key (leave untouched) from an explicit
/// `"region": null` (clear the assignment).
fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<RawRect>>, D::Error>
where
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Partial viewer configuration sent by admins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigPatch {
    /// `Some(None)` clears the region; `None` leaves it untouched.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub region: Option<Option<RawRect>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Participant → hub messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    RegisterBroadcaster {
        geometry: StreamGeometry,
    },
    RegisterViewer {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// Viewer bootstrap: fetch own record.
    GetClientConfig {
        client_id: ClientId,
    },
    /// Admin bootstrap: fetch the roster. Also binds the transport to the
    /// admin role.
    GetClients {},
    UpdateClientConfig {
        client_id: ClientId,
        config: ClientConfigPatch,
    },
    BroadcasterOffer {
        viewer_transport_id: TransportId,
        sdp: Value,
    },
    ViewerAnswer {
        sdp: Value,
    },
    BroadcasterIceCandidate {
        viewer_transport_id: TransportId,
        candidate: Value,
    },
    ViewerIceCandidate {
        candidate: Value,
    },
}

/// Hub → participant messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full viewer record, sent to the viewer on bind and on config change.
    ClientConfig {
        #[serde(flatten)]
        record: ViewerRecord,
    },
    /// Region-only update to a viewer; signals that the media session must
    /// NOT be torn down.
    RegionUpdate {
        client_id: ClientId,
        region: Option<Rectangle>,
        #[serde(skip_serializing_if = "Option::is_none")]
        geometry: Option<StreamGeometry>,
    },
    /// Roster snapshot, sent to admins on every roster change.
    ClientsUpdate {
        clients: Vec<ViewerRecord>,
    },
    StreamDimensions {
        width: u32,
        height: u32,
    },
    StreamDimensionsUpdate {
        width: u32,
        height: u32,
    },
    /// A viewer is available for a media session (to the broadcaster).
    NewViewer {
        viewer_transport_id: TransportId,
        client_id: ClientId,
    },
    /// A viewer's region changed (to the broadcaster, coalesced).
    ClientRegionUpdated {
        client_id: ClientId,
        region: Option<Rectangle>,
    },
    BroadcasterOffer {
        sdp: Value,
    },
    ViewerAnswer {
        viewer_transport_id: TransportId,
        sdp: Value,
    },
    BroadcasterIceCandidate {
        candidate: Value,
    },
    ViewerIceCandidate {
        viewer_transport_id: TransportId,
        candidate: Value,
    },
    ViewerDisconnected {
        viewer_transport_id: TransportId,
    },
    BroadcasterDisconnected {},
    Error {
        code: String,
        message: String,
    },
}
