//! Authoritative session registry
//!
//! All session state (viewer roster, broadcaster slot, stream geometry)
//! lives behind a single owner task that drains a command queue. Mutations
//! are totally ordered and atomic, which gives the registry's invariants
//! sequential consistency without locks. Every mutation that changes the
//! roster emits exactly one [`RegistryEvent::RosterChanged`].

pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::geometry::{normalize_rect, RawRect, StreamGeometry};

pub use types::{
    BroadcasterRecord, ClientId, DisconnectOutcome, RegionChange, Role, TransportId, ViewerRecord,
};

/// Command queue depth for the registry owner task
const COMMAND_QUEUE_CAPACITY: usize = 256;
/// Upper bound on the stale-record sweep interval
const MAX_GC_INTERVAL: Duration = Duration::from_secs(60);

/// Events emitted by the registry toward the event hub
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Roster changed; payload is a fresh snapshot ordered by clientId.
    RosterChanged(Vec<ViewerRecord>),
    /// A broadcaster published a stream with this geometry.
    GeometryChanged(StreamGeometry),
    /// The broadcaster slot was cleared.
    GeometryCleared,
    /// Unrecoverable invariant violation; the process must exit with code 3.
    Fatal(String),
}

enum Command {
    UpsertViewer {
        client_id: ClientId,
        transport_id: TransportId,
        display_name: Option<String>,
        reply: oneshot::Sender<ViewerRecord>,
    },
    EnsureViewer {
        client_id: ClientId,
        reply: oneshot::Sender<ViewerRecord>,
    },
    MarkDisconnected {
        transport_id: TransportId,
        reply: oneshot::Sender<Option<DisconnectOutcome>>,
    },
    SetRegion {
        client_id: ClientId,
        region: Option<RawRect>,
        reply: oneshot::Sender<Result<RegionChange>>,
    },
    SetDisplayName {
        client_id: ClientId,
        display_name: String,
        reply: oneshot::Sender<Result<ViewerRecord>>,
    },
    RegisterBroadcaster {
        transport_id: TransportId,
        geometry: StreamGeometry,
        reply: oneshot::Sender<Option<TransportId>>,
    },
    SnapshotRoster {
        reply: oneshot::Sender<Vec<ViewerRecord>>,
    },
    GetViewer {
        client_id: ClientId,
        reply: oneshot::Sender<Option<ViewerRecord>>,
    },
    LookupTransport {
        transport_id: TransportId,
        reply: oneshot::Sender<Option<Role>>,
    },
    Geometry {
        reply: oneshot::Sender<Option<StreamGeometry>>,
    },
    BroadcasterTransport {
        reply: oneshot::Sender<Option<TransportId>>,
    },
}

/// Cloneable handle to the registry owner task
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the registry owner task.
    ///
    /// `events` receives the change-notification stream; the consumer fans
    /// roster snapshots out to admins.
    pub fn spawn(stale_ttl: Duration, events: mpsc::Sender<RegistryEvent>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        tokio::spawn(run(rx, stale_ttl, events));
        Self { tx }
    }

    async fn send<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| AppError::RegistryClosed)?;
        rx.await.map_err(|_| AppError::RegistryClosed)
    }

    /// Create or revive a viewer record and bind it to a transport.
    pub async fn upsert_viewer(
        &self,
        client_id: &str,
        transport_id: &str,
        display_name: Option<String>,
    ) -> Result<ViewerRecord> {
        self.send(|reply| Command::UpsertViewer {
            client_id: client_id.to_string(),
            transport_id: transport_id.to_string(),
            display_name,
            reply,
        })
        .await
    }

    /// Create a disconnected viewer record on first operator reference to
    /// the clientId; returns the existing record otherwise.
    pub async fn ensure_viewer(&self, client_id: &str) -> Result<ViewerRecord> {
        self.send(|reply| Command::EnsureViewer {
            client_id: client_id.to_string(),
            reply,
        })
        .await
    }

    /// Flip the participant bound to `transport_id` to disconnected.
    /// Viewer records are retained; the broadcaster slot is cleared.
    pub async fn mark_disconnected(&self, transport_id: &str) -> Result<Option<DisconnectOutcome>> {
        self.send(|reply| Command::MarkDisconnected {
            transport_id: transport_id.to_string(),
            reply,
        })
        .await
    }

    /// Update (or clear, with `None`) a viewer's region. The rectangle is
    /// normalized against the current geometry before storage.
    pub async fn set_region(
        &self,
        client_id: &str,
        region: Option<RawRect>,
    ) -> Result<RegionChange> {
        self.send(|reply| Command::SetRegion {
            client_id: client_id.to_string(),
            region,
            reply,
        })
        .await?
    }

    pub async fn set_display_name(
        &self,
        client_id: &str,
        display_name: String,
    ) -> Result<ViewerRecord> {
        self.send(|reply| Command::SetDisplayName {
            client_id: client_id.to_string(),
            display_name,
            reply,
        })
        .await?
    }

    /// Install a broadcaster, replacing any prior occupant. Returns the
    /// previous occupant's transport id so the caller can close it.
    pub async fn register_broadcaster(
        &self,
        transport_id: &str,
        geometry: StreamGeometry,
    ) -> Result<Option<TransportId>> {
        self.send(|reply| Command::RegisterBroadcaster {
            transport_id: transport_id.to_string(),
            geometry,
            reply,
        })
        .await
    }

    /// Full roster, ordered by clientId ascending.
    pub async fn snapshot_roster(&self) -> Result<Vec<ViewerRecord>> {
        self.send(|reply| Command::SnapshotRoster { reply }).await
    }

    pub async fn get_viewer(&self, client_id: &str) -> Result<Option<ViewerRecord>> {
        self.send(|reply| Command::GetViewer {
            client_id: client_id.to_string(),
            reply,
        })
        .await
    }

    /// Reverse index used by disconnection handling.
    pub async fn lookup_transport(&self, transport_id: &str) -> Result<Option<Role>> {
        self.send(|reply| Command::LookupTransport {
            transport_id: transport_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn geometry(&self) -> Result<Option<StreamGeometry>> {
        self.send(|reply| Command::Geometry { reply }).await
    }

    pub async fn broadcaster_transport(&self) -> Result<Option<TransportId>> {
        self.send(|reply| Command::BroadcasterTransport { reply }).await
    }
}

struct Registry {
    viewers: BTreeMap<ClientId, ViewerRecord>,
    by_transport: HashMap<TransportId, Role>,
    broadcaster: Option<BroadcasterRecord>,
    stale_ttl: Duration,
    events: mpsc::Sender<RegistryEvent>,
}

async fn run(
    mut rx: mpsc::Receiver<Command>,
    stale_ttl: Duration,
    events: mpsc::Sender<RegistryEvent>,
) {
    let mut registry = Registry {
        viewers: BTreeMap::new(),
        by_transport: HashMap::new(),
        broadcaster: None,
        stale_ttl,
        events,
    };

    let gc_period = (stale_ttl / 2).clamp(Duration::from_millis(10), MAX_GC_INTERVAL);
    let mut gc_tick = tokio::time::interval(gc_period);
    gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => registry.handle(cmd).await,
                    None => break,
                }
            }
            _ = gc_tick.tick() => {
                registry.collect_stale().await;
            }
        }
    }

    debug!("Registry owner task exiting");
}

impl Registry {
    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::UpsertViewer {
                client_id,
                transport_id,
                display_name,
                reply,
            } => {
                let record = self.upsert_viewer(client_id, transport_id, display_name);
                let _ = reply.send(record);
                self.emit_roster().await;
            }
            Command::EnsureViewer { client_id, reply } => {
                let created = !self.viewers.contains_key(&client_id);
                let record = self
                    .viewers
                    .entry(client_id.clone())
                    .or_insert_with(|| ViewerRecord::new(client_id))
                    .clone();
                let _ = reply.send(record);
                if created {
                    self.emit_roster().await;
                }
            }
            Command::MarkDisconnected {
                transport_id,
                reply,
            } => {
                let outcome = self.mark_disconnected(&transport_id);
                let roster_changed = matches!(outcome, Some(DisconnectOutcome::Viewer(_)));
                let geometry_cleared = matches!(outcome, Some(DisconnectOutcome::Broadcaster));
                let _ = reply.send(outcome);
                if roster_changed {
                    self.emit_roster().await;
                }
                if geometry_cleared {
                    let _ = self.events.send(RegistryEvent::GeometryCleared).await;
                }
            }
            Command::SetRegion {
                client_id,
                region,
                reply,
            } => {
                let result = self.set_region(&client_id, region);
                let changed = matches!(&result, Ok(change) if change.changed);
                let _ = reply.send(result);
                if changed {
                    self.emit_roster().await;
                }
            }
            Command::SetDisplayName {
                client_id,
                display_name,
                reply,
            } => {
                let result = self.set_display_name(&client_id, display_name);
                let ok = result.is_ok();
                let _ = reply.send(result);
                if ok {
                    self.emit_roster().await;
                }
            }
            Command::RegisterBroadcaster {
                transport_id,
                geometry,
                reply,
            } => {
                let previous = self.register_broadcaster(transport_id, geometry);
                let _ = reply.send(previous);
                let _ = self
                    .events
                    .send(RegistryEvent::GeometryChanged(geometry))
                    .await;
                self.verify_invariants().await;
            }
            Command::SnapshotRoster { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::GetViewer { client_id, reply } => {
                let _ = reply.send(self.viewers.get(&client_id).cloned());
            }
            Command::LookupTransport {
                transport_id,
                reply,
            } => {
                let _ = reply.send(self.by_transport.get(&transport_id).cloned());
            }
            Command::Geometry { reply } => {
                let _ = reply.send(self.broadcaster.as_ref().map(|b| b.geometry));
            }
            Command::BroadcasterTransport { reply } => {
                let _ = reply.send(self.broadcaster.as_ref().map(|b| b.transport_id.clone()));
            }
        }
    }

    fn upsert_viewer(
        &mut self,
        client_id: ClientId,
        transport_id: TransportId,
        display_name: Option<String>,
    ) -> ViewerRecord {
        let record = self
            .viewers
            .entry(client_id.clone())
            .or_insert_with(|| ViewerRecord::new(client_id.clone()));

        // A reconnect may arrive before the old socket's disconnect is
        // observed; drop the stale transport binding.
        if let Some(old) = record.transport_id.take() {
            self.by_transport.remove(&old);
        }

        record.transport_id = Some(transport_id.clone());
        record.connected = true;
        record.disconnected_at = None;
        if let Some(name) = display_name {
            record.display_name = Some(name);
        }
        record.touch();

        self.by_transport
            .insert(transport_id, Role::Viewer(client_id.clone()));

        info!(client_id = %client_id, "Viewer registered");
        record.clone()
    }

    fn mark_disconnected(&mut self, transport_id: &str) -> Option<DisconnectOutcome> {
        match self.by_transport.remove(transport_id)? {
            Role::Viewer(client_id) => {
                if let Some(record) = self.viewers.get_mut(&client_id) {
                    record.connected = false;
                    record.transport_id = None;
                    record.disconnected_at = Some(Instant::now());
                    record.touch();
                }
                info!(client_id = %client_id, "Viewer disconnected");
                Some(DisconnectOutcome::Viewer(client_id))
            }
            Role::Broadcaster => {
                self.broadcaster = None;
                info!("Broadcaster disconnected, geometry cleared");
                Some(DisconnectOutcome::Broadcaster)
            }
            Role::Admin => Some(DisconnectOutcome::Admin),
        }
    }

    fn set_region(&mut self, client_id: &str, region: Option<RawRect>) -> Result<RegionChange> {
        let geometry = self.broadcaster.as_ref().map(|b| b.geometry);
        let record = self
            .viewers
            .get_mut(client_id)
            .ok_or_else(|| AppError::UnknownViewer(client_id.to_string()))?;

        let normalized = match region {
            Some(raw) => Some(normalize_rect(raw, geometry)?),
            None => None,
        };

        if record.region == normalized {
            return Ok(RegionChange {
                record: record.clone(),
                changed: false,
            });
        }

        record.region = normalized;
        record.touch();
        debug!(client_id = %client_id, region = ?normalized, "Region updated");

        Ok(RegionChange {
            record: record.clone(),
            changed: true,
        })
    }

    fn set_display_name(&mut self, client_id: &str, display_name: String) -> Result<ViewerRecord> {
        let record = self
            .viewers
            .get_mut(client_id)
            .ok_or_else(|| AppError::UnknownViewer(client_id.to_string()))?;
        record.display_name = Some(display_name);
        record.touch();
        Ok(record.clone())
    }

    fn register_broadcaster(
        &mut self,
        transport_id: TransportId,
        geometry: StreamGeometry,
    ) -> Option<TransportId> {
        let previous = self.broadcaster.replace(BroadcasterRecord {
            transport_id: transport_id.clone(),
            geometry,
        });

        let previous_transport = previous.map(|b| b.transport_id);
        if let Some(ref old) = previous_transport {
            self.by_transport.remove(old);
            warn!(old_transport = %old, "Broadcaster replaced by new registration");
        }
        self.by_transport.insert(transport_id, Role::Broadcaster);

        info!(%geometry, "Broadcaster registered");
        previous_transport
    }

    fn snapshot(&self) -> Vec<ViewerRecord> {
        // BTreeMap iteration gives the clientId-ascending order the roster
        // contract requires.
        self.viewers.values().cloned().collect()
    }

    async fn emit_roster(&self) {
        let _ = self
            .events
            .send(RegistryEvent::RosterChanged(self.snapshot()))
            .await;
    }

    async fn collect_stale(&mut self) {
        let ttl = self.stale_ttl;
        let expired: Vec<ClientId> = self
            .viewers
            .values()
            .filter(|record| {
                !record.connected
                    && record
                        .disconnected_at
                        .map(|at| at.elapsed() >= ttl)
                        .unwrap_or(false)
            })
            .map(|record| record.client_id.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        for client_id in &expired {
            self.viewers.remove(client_id);
            info!(client_id = %client_id, "Stale viewer record collected");
        }
        self.emit_roster().await;
    }

    /// Post-arbitration sanity check: the transport index must agree with
    /// the broadcaster slot. A second live broadcaster binding is fatal.
    async fn verify_invariants(&self) {
        let broadcaster_bindings = self
            .by_transport
            .values()
            .filter(|role| matches!(role, Role::Broadcaster))
            .count();
        let expected = usize::from(self.broadcaster.is_some());

        if broadcaster_bindings != expected {
            let message = format!(
                "{} broadcaster transport bindings with {} active slot(s)",
                broadcaster_bindings, expected
            );
            let _ = self.events.send(RegistryEvent::Fatal(message)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::RawRect;

    fn raw(x: f64, y: f64, width: f64, height: f64) -> RawRect {
        RawRect {
            x,
            y,
            width,
            height,
        }
    }

    fn spawn_registry() -> (RegistryHandle, mpsc::Receiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = RegistryHandle::spawn(Duration::from_secs(1800), events_tx);
        (handle, events_rx)
    }

    async fn next_roster(rx: &mut mpsc::Receiver<RegistryEvent>) -> Vec<ViewerRecord> {
        loop {
            match rx.recv().await.expect("registry event stream closed") {
                RegistryEvent::RosterChanged(snapshot) => return snapshot,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_and_revives() {
        let (registry, mut events) = spawn_registry();

        let record = registry
            .upsert_viewer("wall-a", "t-1", Some("North".into()))
            .await
            .unwrap();
        assert!(record.connected);
        assert_eq!(record.transport_id.as_deref(), Some("t-1"));
        assert_eq!(next_roster(&mut events).await.len(), 1);

        registry.mark_disconnected("t-1").await.unwrap();
        let roster = next_roster(&mut events).await;
        assert!(!roster[0].connected);

        // Reconnect with a fresh transport keeps identity and display name
        let revived = registry.upsert_viewer("wall-a", "t-2", None).await.unwrap();
        assert!(revived.connected);
        assert_eq!(revived.transport_id.as_deref(), Some("t-2"));
        assert_eq!(revived.display_name.as_deref(), Some("North"));
    }

    #[tokio::test]
    async fn test_region_survives_reconnect() {
        let (registry, _events) = spawn_registry();

        registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();
        registry
            .set_region("wall-a", Some(raw(0.0, 0.0, 640.0, 360.0)))
            .await
            .unwrap();

        registry.mark_disconnected("t-1").await.unwrap();
        registry.upsert_viewer("wall-a", "t-2", None).await.unwrap();

        let record = registry.get_viewer("wall-a").await.unwrap().unwrap();
        assert_eq!(
            record.region,
            Some(crate::geometry::Rectangle::new(0, 0, 640, 360))
        );
    }

    #[tokio::test]
    async fn test_set_region_unknown_viewer() {
        let (registry, _events) = spawn_registry();
        let err = registry
            .set_region("ghost", Some(raw(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownViewer(_)));
    }

    #[tokio::test]
    async fn test_noop_region_set_emits_no_event() {
        let (registry, mut events) = spawn_registry();

        registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();
        let _ = next_roster(&mut events).await;

        let first = registry
            .set_region("wall-a", Some(raw(0.0, 0.0, 640.0, 360.0)))
            .await
            .unwrap();
        assert!(first.changed);
        let _ = next_roster(&mut events).await;

        let second = registry
            .set_region("wall-a", Some(raw(0.0, 0.0, 640.0, 360.0)))
            .await
            .unwrap();
        assert!(!second.changed);

        // The next event must come from a different mutation, proving the
        // no-op emitted nothing in between.
        registry.upsert_viewer("wall-b", "t-2", None).await.unwrap();
        let roster = next_roster(&mut events).await;
        assert_eq!(roster.len(), 2);
    }

    #[tokio::test]
    async fn test_region_clipped_to_geometry() {
        let (registry, _events) = spawn_registry();

        registry
            .register_broadcaster("b-1", StreamGeometry::new(1920, 1080).unwrap())
            .await
            .unwrap();
        registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();

        let change = registry
            .set_region("wall-a", Some(raw(1800.0, 0.0, 640.0, 360.0)))
            .await
            .unwrap();
        assert_eq!(
            change.record.region,
            Some(crate::geometry::Rectangle::new(1800, 0, 120, 360))
        );
    }

    #[tokio::test]
    async fn test_broadcaster_replacement_returns_previous() {
        let (registry, _events) = spawn_registry();
        let geometry = StreamGeometry::new(1920, 1080).unwrap();

        let first = registry.register_broadcaster("b-1", geometry).await.unwrap();
        assert!(first.is_none());

        let second = registry.register_broadcaster("b-2", geometry).await.unwrap();
        assert_eq!(second.as_deref(), Some("b-1"));

        // The replaced transport no longer resolves
        assert!(registry.lookup_transport("b-1").await.unwrap().is_none());
        assert!(matches!(
            registry.lookup_transport("b-2").await.unwrap(),
            Some(Role::Broadcaster)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_client_id() {
        let (registry, _events) = spawn_registry();

        for (client, transport) in [("wall-c", "t-3"), ("wall-a", "t-1"), ("wall-b", "t-2")] {
            registry.upsert_viewer(client, transport, None).await.unwrap();
        }

        let roster = registry.snapshot_roster().await.unwrap();
        let ids: Vec<&str> = roster.iter().map(|r| r.client_id.as_str()).collect();
        assert_eq!(ids, vec!["wall-a", "wall-b", "wall-c"]);
    }

    #[tokio::test]
    async fn test_last_seen_monotonic_across_mutations() {
        let (registry, _events) = spawn_registry();

        let first = registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();
        registry
            .set_region("wall-a", Some(raw(0.0, 0.0, 10.0, 10.0)))
            .await
            .unwrap();
        registry.mark_disconnected("t-1").await.unwrap();
        let last = registry.get_viewer("wall-a").await.unwrap().unwrap();

        assert!(last.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn test_stale_records_collected() {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let registry = RegistryHandle::spawn(Duration::from_millis(50), events_tx);

        registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();
        registry.mark_disconnected("t-1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get_viewer("wall-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connected_viewer_not_collected() {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let registry = RegistryHandle::spawn(Duration::from_millis(50), events_tx);

        registry.upsert_viewer("wall-a", "t-1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get_viewer("wall-a").await.unwrap().is_some());
    }
}
