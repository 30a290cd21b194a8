//! Session registry records

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::{Rectangle, StreamGeometry};

/// Stable operator-visible viewer identity; survives reconnects.
pub type ClientId = String;
/// Ephemeral per-connection identity; changes on every reconnect.
pub type TransportId = String;

/// Role a transport is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Broadcaster,
    Viewer(ClientId),
    Admin,
}

/// Viewer record, keyed by stable clientId
///
/// The record is created on first registration or first operator reference
/// and survives disconnects; only `transport_id` and `connected` flip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRecord {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub connected: bool,
    pub region: Option<Rectangle>,
    pub last_seen_at: DateTime<Utc>,
    /// When the viewer disconnected, for stale-record collection.
    #[serde(skip)]
    pub disconnected_at: Option<Instant>,
}

impl ViewerRecord {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            transport_id: None,
            display_name: None,
            connected: false,
            region: None,
            last_seen_at: Utc::now(),
            disconnected_at: None,
        }
    }

    /// Bump `last_seen_at`, keeping it monotonic even if the wall clock
    /// steps backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_seen_at {
            self.last_seen_at = now;
        }
    }
}

/// The single active broadcaster slot
#[derive(Debug, Clone)]
pub struct BroadcasterRecord {
    pub transport_id: TransportId,
    pub geometry: StreamGeometry,
}

/// Outcome of a disconnect lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// A viewer went offline; the record is retained.
    Viewer(ClientId),
    /// The active broadcaster went away; geometry is cleared.
    Broadcaster,
    /// An admin observer went away.
    Admin,
}

/// Outcome of a region update
#[derive(Debug, Clone)]
pub struct RegionChange {
    pub record: ViewerRecord,
    /// False when the normalized region equals the stored one; no roster
    /// event is emitted in that case.
    pub changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = ViewerRecord::new("wall-a".to_string());
        let first = record.last_seen_at;
        record.touch();
        assert!(record.last_seen_at >= first);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = ViewerRecord::new("wall-a".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["clientId"], "wall-a");
        assert_eq!(json["connected"], false);
        assert!(json["region"].is_null());
        assert!(json.get("lastSeenAt").is_some());
        // Disconnected viewers have no transport binding on the wire
        assert!(json.get("transportId").is_none());
    }
}
