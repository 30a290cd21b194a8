//! Application-wide state shared across handlers

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::HubConfig;
use crate::hub::coalesce::RegionCoalescer;
use crate::hub::EventHub;
use crate::messages::ServerMessage;
use crate::registry::{RegistryEvent, RegistryHandle};
use crate::router::SignalRouter;

/// Capacity of the registry → hub event channel
const REGISTRY_EVENT_CAPACITY: usize = 256;

pub struct AppState {
    /// Hub configuration
    pub config: HubConfig,
    /// Authoritative session registry
    pub registry: RegistryHandle,
    /// Participant table and egress paths
    pub hub: Arc<EventHub>,
    /// SDP/ICE forwarding
    pub router: Arc<SignalRouter>,
    /// Region-change coalescing toward the broadcaster
    pub coalescer: Arc<RegionCoalescer>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
    /// Fatal invariant reports; `main` exits with code 3 on receipt
    fatal_tx: mpsc::Sender<String>,
}

impl AppState {
    /// Build the hub component graph and spawn its background tasks.
    ///
    /// The returned receiver yields fatal invariant reports.
    pub fn new(config: HubConfig) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let (registry_events_tx, registry_events_rx) = mpsc::channel(REGISTRY_EVENT_CAPACITY);

        let hub = EventHub::new(config.outbound_queue_capacity);
        let registry = RegistryHandle::spawn(config.stale_ttl(), registry_events_tx);
        let router = SignalRouter::new(registry.clone(), hub.clone());
        let coalescer = RegionCoalescer::new(hub.clone(), config.coalesce_window());

        let state = Arc::new(Self {
            config,
            registry,
            hub,
            router,
            coalescer,
            shutdown_tx,
            fatal_tx,
        });

        state.clone().spawn_registry_fanout(registry_events_rx);
        (state, fatal_rx)
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Consume registry change notifications and fan them out by role.
    fn spawn_registry_fanout(self: Arc<Self>, mut rx: mpsc::Receiver<RegistryEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RegistryEvent::RosterChanged(clients) => {
                        self.hub
                            .broadcast_admins(ServerMessage::ClientsUpdate { clients });
                    }
                    RegistryEvent::GeometryChanged(geometry) => {
                        self.hub
                            .broadcast_watchers(ServerMessage::StreamDimensionsUpdate {
                                width: geometry.width,
                                height: geometry.height,
                            });
                    }
                    RegistryEvent::GeometryCleared => {
                        self.hub
                            .broadcast_watchers(ServerMessage::BroadcasterDisconnected {});
                    }
                    RegistryEvent::Fatal(message) => {
                        let _ = self.fatal_tx.send(message).await;
                        break;
                    }
                }
            }
            info!("Registry fan-out task exiting");
        });
    }
}
