//! Coalescing of per-viewer region-change notifications
//!
//! Admin drag operations produce bursts of region updates for the same
//! viewer. The broadcaster only needs the latest: within the configured
//! window, later updates overwrite the pending one and a single
//! `client-region-updated` is emitted when the window ends. Other event
//! kinds are never coalesced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::geometry::Rectangle;
use crate::hub::EventHub;
use crate::messages::ServerMessage;
use crate::registry::types::ClientId;

pub struct RegionCoalescer {
    hub: Arc<EventHub>,
    window: Duration,
    pending: Arc<Mutex<HashMap<ClientId, Option<Rectangle>>>>,
}

impl RegionCoalescer {
    pub fn new(hub: Arc<EventHub>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            hub,
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Queue a region change for the broadcaster. The first submission for a
    /// clientId opens a window; submissions landing inside it only replace
    /// the pending value.
    pub fn submit(&self, client_id: ClientId, region: Option<Rectangle>) {
        {
            let mut pending = self.pending.lock();
            if let Some(slot) = pending.get_mut(&client_id) {
                *slot = region;
                return;
            }
            pending.insert(client_id.clone(), region);
        }

        let hub = self.hub.clone();
        let pending = self.pending.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let region = pending.lock().remove(&client_id);
            if let Some(region) = region {
                hub.send_to_broadcaster(ServerMessage::ClientRegionUpdated { client_id, region });
            }
        });
    }
}
