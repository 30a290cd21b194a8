//! Inbound message dispatch
//!
//! The single boundary where participant messages mutate hub state. Bad
//! input is dropped with a warning and never changes state; targeted
//! notifications are sent from here, while roster and geometry fan-outs
//! ride the registry's change-notification stream.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::AppError;
use crate::geometry::StreamGeometry;
use crate::hub::ParticipantRole;
use crate::messages::{ClientConfigPatch, ClientMessage, ServerMessage};
use crate::registry::types::DisconnectOutcome;
use crate::state::AppState;

/// Handle one inbound message from a participant.
pub async fn handle_message(state: &Arc<AppState>, transport_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::RegisterBroadcaster { geometry } => {
            register_broadcaster(state, transport_id, geometry).await;
        }
        ClientMessage::RegisterViewer {
            client_id,
            display_name,
        } => {
            register_viewer(state, transport_id, &client_id, display_name).await;
        }
        ClientMessage::GetClientConfig { client_id } => {
            match state.registry.get_viewer(&client_id).await {
                Ok(Some(record)) => {
                    state
                        .hub
                        .send_to(transport_id, ServerMessage::ClientConfig { record });
                }
                Ok(None) => {
                    send_error(state, transport_id, &AppError::UnknownViewer(client_id));
                }
                Err(err) => send_error(state, transport_id, &err),
            }
        }
        ClientMessage::GetClients {} => {
            // First roster request binds the transport to the admin role.
            if matches!(
                state.hub.role(transport_id),
                Some(ParticipantRole::Unbound)
            ) {
                state.hub.bind_role(transport_id, ParticipantRole::Admin);
            }
            if let Ok(clients) = state.registry.snapshot_roster().await {
                state
                    .hub
                    .send_to(transport_id, ServerMessage::ClientsUpdate { clients });
            }
            if let Ok(Some(geometry)) = state.registry.geometry().await {
                state.hub.send_to(
                    transport_id,
                    ServerMessage::StreamDimensions {
                        width: geometry.width,
                        height: geometry.height,
                    },
                );
            }
        }
        ClientMessage::UpdateClientConfig { client_id, config } => {
            update_client_config(state, transport_id, &client_id, config).await;
        }
        ClientMessage::BroadcasterOffer {
            viewer_transport_id,
            sdp,
        } => {
            if !is_broadcaster(state, transport_id) {
                warn!(transport_id = %transport_id, "Offer from non-broadcaster dropped");
                return;
            }
            state.router.offer_to_viewer(&viewer_transport_id, sdp);
        }
        ClientMessage::ViewerAnswer { sdp } => {
            if !is_viewer(state, transport_id) {
                warn!(transport_id = %transport_id, "Answer from non-viewer dropped");
                return;
            }
            state.router.answer_to_broadcaster(transport_id, sdp).await;
        }
        ClientMessage::BroadcasterIceCandidate {
            viewer_transport_id,
            candidate,
        } => {
            if !is_broadcaster(state, transport_id) {
                warn!(transport_id = %transport_id, "ICE from non-broadcaster dropped");
                return;
            }
            state.router.ice_to_viewer(&viewer_transport_id, candidate);
        }
        ClientMessage::ViewerIceCandidate { candidate } => {
            if !is_viewer(state, transport_id) {
                warn!(transport_id = %transport_id, "ICE from non-viewer dropped");
                return;
            }
            state.router.ice_to_broadcaster(transport_id, candidate).await;
        }
    }
}

/// Handle a participant's transport going away.
pub async fn handle_disconnect(state: &Arc<AppState>, transport_id: &str) {
    state.hub.detach(transport_id);

    match state.registry.mark_disconnected(transport_id).await {
        Ok(Some(DisconnectOutcome::Viewer(client_id))) => {
            debug!(client_id = %client_id, "Viewer transport closed");
            state
                .hub
                .send_to_broadcaster(ServerMessage::ViewerDisconnected {
                    viewer_transport_id: transport_id.to_string(),
                });
        }
        Ok(Some(DisconnectOutcome::Broadcaster)) => {
            // broadcaster-disconnected fan-out rides the GeometryCleared
            // registry event.
            debug!("Broadcaster transport closed");
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "Disconnect bookkeeping failed"),
    }
}

async fn register_broadcaster(
    state: &Arc<AppState>,
    transport_id: &str,
    geometry: StreamGeometry,
) {
    let geometry = match StreamGeometry::new(geometry.width, geometry.height) {
        Ok(geometry) => geometry,
        Err(err) => {
            send_error(state, transport_id, &err);
            return;
        }
    };

    let previous = match state
        .registry
        .register_broadcaster(transport_id, geometry)
        .await
    {
        Ok(previous) => previous,
        Err(err) => {
            send_error(state, transport_id, &err);
            return;
        }
    };

    state
        .hub
        .bind_role(transport_id, ParticipantRole::Broadcaster);

    // Arbitration: the prior broadcaster's transport is closed.
    if let Some(previous) = previous {
        if previous != transport_id {
            state.hub.close(&previous);
        }
    }

    // Replay the roster so the new broadcaster can build viewer sessions
    // without waiting for fresh registrations.
    if let Ok(roster) = state.registry.snapshot_roster().await {
        for record in roster {
            let viewer_transport_id = match (record.connected, record.transport_id.clone()) {
                (true, Some(id)) => id,
                _ => continue,
            };
            state.hub.send_to(
                transport_id,
                ServerMessage::NewViewer {
                    viewer_transport_id,
                    client_id: record.client_id.clone(),
                },
            );
            if record.region.is_some() {
                state.hub.send_to(
                    transport_id,
                    ServerMessage::ClientRegionUpdated {
                        client_id: record.client_id,
                        region: record.region,
                    },
                );
            }
        }
    }
}

async fn register_viewer(
    state: &Arc<AppState>,
    transport_id: &str,
    client_id: &str,
    display_name: Option<String>,
) {
    if client_id.is_empty() {
        send_error(
            state,
            transport_id,
            &AppError::BadInput("clientId must not be empty".to_string()),
        );
        return;
    }

    let record = match state
        .registry
        .upsert_viewer(client_id, transport_id, display_name)
        .await
    {
        Ok(record) => record,
        Err(err) => {
            send_error(state, transport_id, &err);
            return;
        }
    };

    state
        .hub
        .bind_role(transport_id, ParticipantRole::Viewer(client_id.to_string()));

    let region = record.region;
    state
        .hub
        .send_to(transport_id, ServerMessage::ClientConfig { record });

    if let Ok(Some(geometry)) = state.registry.geometry().await {
        state.hub.send_to(
            transport_id,
            ServerMessage::StreamDimensions {
                width: geometry.width,
                height: geometry.height,
            },
        );
    }

    // Rendezvous trigger: the broadcaster learns about the viewer and, when
    // a region is already assigned, can create the media session right away.
    state.hub.send_to_broadcaster(ServerMessage::NewViewer {
        viewer_transport_id: transport_id.to_string(),
        client_id: client_id.to_string(),
    });
    if region.is_some() {
        state
            .hub
            .send_to_broadcaster(ServerMessage::ClientRegionUpdated {
                client_id: client_id.to_string(),
                region,
            });
    }
}

async fn update_client_config(
    state: &Arc<AppState>,
    transport_id: &str,
    client_id: &str,
    config: ClientConfigPatch,
) {
    if client_id.is_empty() {
        send_error(
            state,
            transport_id,
            &AppError::BadInput("clientId must not be empty".to_string()),
        );
        return;
    }

    // First operator reference creates the record, so regions can be
    // assigned before the viewer ever connects.
    if let Err(err) = state.registry.ensure_viewer(client_id).await {
        send_error(state, transport_id, &err);
        return;
    }

    if let Some(region_patch) = config.region {
        match state.registry.set_region(client_id, region_patch).await {
            Ok(change) if change.changed => {
                let geometry = state.registry.geometry().await.ok().flatten();
                // Dedicated region-only channel: the viewer must not tear
                // down its media session.
                state.hub.send_to_viewer(
                    client_id,
                    ServerMessage::RegionUpdate {
                        client_id: client_id.to_string(),
                        region: change.record.region,
                        geometry,
                    },
                );
                state
                    .coalescer
                    .submit(client_id.to_string(), change.record.region);
            }
            Ok(_) => {
                debug!(client_id = %client_id, "Region unchanged, no notifications");
            }
            Err(err) => {
                send_error(state, transport_id, &err);
                return;
            }
        }
    }

    if let Some(display_name) = config.display_name {
        match state.registry.set_display_name(client_id, display_name).await {
            Ok(record) => {
                state
                    .hub
                    .send_to_viewer(client_id, ServerMessage::ClientConfig { record });
            }
            Err(err) => send_error(state, transport_id, &err),
        }
    }
}

fn is_broadcaster(state: &Arc<AppState>, transport_id: &str) -> bool {
    matches!(
        state.hub.role(transport_id),
        Some(ParticipantRole::Broadcaster)
    )
}

fn is_viewer(state: &Arc<AppState>, transport_id: &str) -> bool {
    matches!(
        state.hub.role(transport_id),
        Some(ParticipantRole::Viewer(_))
    )
}

fn send_error(state: &Arc<AppState>, transport_id: &str, err: &AppError) {
    warn!(transport_id = %transport_id, error = %err, "Rejected participant message");
    state.hub.send_to(
        transport_id,
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::geometry::{RawRect, Rectangle};
    use crate::messages::ClientMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_state() -> Arc<AppState> {
        let (state, _fatal_rx) = AppState::new(HubConfig::default());
        state
    }

    fn update_region(client_id: &str, rect: RawRect) -> ClientMessage {
        ClientMessage::UpdateClientConfig {
            client_id: client_id.to_string(),
            config: ClientConfigPatch {
                region: Some(Some(rect)),
                display_name: None,
            },
        }
    }

    fn raw(x: f64, y: f64, width: f64, height: f64) -> RawRect {
        RawRect {
            x,
            y,
            width,
            height,
        }
    }

    async fn recv_skipping_roster(
        rx: &mut mpsc::Receiver<ServerMessage>,
    ) -> Option<ServerMessage> {
        loop {
            match rx.try_recv() {
                Ok(ServerMessage::ClientsUpdate { .. }) => continue,
                Ok(msg) => return Some(msg),
                Err(_) => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_assign_before_connect_creates_record() {
        let state = test_state();
        let (admin, _admin_rx) = state.hub.attach();

        handle_message(
            &state,
            &admin,
            ClientMessage::GetClients {},
        )
        .await;
        handle_message(&state, &admin, update_region("wall-a", raw(0.0, 0.0, 640.0, 360.0)))
            .await;

        let record = state.registry.get_viewer("wall-a").await.unwrap().unwrap();
        assert!(!record.connected);
        assert_eq!(record.region, Some(Rectangle::new(0, 0, 640, 360)));
    }

    #[tokio::test]
    async fn test_viewer_registration_replies_config_and_notifies_broadcaster() {
        let state = test_state();

        let (broadcaster, mut broadcaster_rx) = state.hub.attach();
        handle_message(
            &state,
            &broadcaster,
            ClientMessage::RegisterBroadcaster {
                geometry: StreamGeometry {
                    width: 1920,
                    height: 1080,
                },
            },
        )
        .await;

        let (viewer, mut viewer_rx) = state.hub.attach();
        handle_message(
            &state,
            &viewer,
            ClientMessage::RegisterViewer {
                client_id: "wall-a".to_string(),
                display_name: None,
            },
        )
        .await;

        // Viewer: client-config then stream-dimensions
        assert!(matches!(
            viewer_rx.try_recv(),
            Ok(ServerMessage::ClientConfig { .. })
        ));
        assert!(matches!(
            viewer_rx.try_recv(),
            Ok(ServerMessage::StreamDimensions {
                width: 1920,
                height: 1080
            })
        ));

        // Broadcaster: new-viewer with the viewer's transport id
        match recv_skipping_roster(&mut broadcaster_rx).await {
            Some(ServerMessage::NewViewer {
                viewer_transport_id,
                client_id,
            }) => {
                assert_eq!(viewer_transport_id, viewer);
                assert_eq!(client_id, "wall-a");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcaster_swap_closes_previous_and_replays_roster() {
        let state = test_state();
        let geometry = StreamGeometry {
            width: 1920,
            height: 1080,
        };

        let (first, mut first_rx) = state.hub.attach();
        handle_message(
            &state,
            &first,
            ClientMessage::RegisterBroadcaster { geometry },
        )
        .await;

        let (viewer, _viewer_rx) = state.hub.attach();
        handle_message(
            &state,
            &viewer,
            ClientMessage::RegisterViewer {
                client_id: "wall-a".to_string(),
                display_name: None,
            },
        )
        .await;
        handle_message(&state, &viewer, update_region("wall-a", raw(0.0, 0.0, 640.0, 360.0)))
            .await;

        let (second, mut second_rx) = state.hub.attach();
        handle_message(
            &state,
            &second,
            ClientMessage::RegisterBroadcaster { geometry },
        )
        .await;

        // First broadcaster's transport is closed
        assert!(!state.hub.is_attached(&first));
        while first_rx.try_recv().is_ok() {}
        assert!(first_rx.try_recv().is_err());

        // New broadcaster sees the existing viewer and its region
        let mut saw_new_viewer = false;
        let mut saw_region = false;
        while let Some(msg) = recv_skipping_roster(&mut second_rx).await {
            match msg {
                ServerMessage::NewViewer { client_id, .. } => {
                    assert_eq!(client_id, "wall-a");
                    saw_new_viewer = true;
                }
                ServerMessage::ClientRegionUpdated { region, .. } => {
                    assert_eq!(region, Some(Rectangle::new(0, 0, 640, 360)));
                    saw_region = true;
                }
                _ => {}
            }
        }
        assert!(saw_new_viewer && saw_region);

        // No record lost its region in the swap
        let record = state.registry.get_viewer("wall-a").await.unwrap().unwrap();
        assert_eq!(record.region, Some(Rectangle::new(0, 0, 640, 360)));
    }

    #[tokio::test]
    async fn test_region_update_uses_dedicated_channel() {
        let state = test_state();

        let (viewer, mut viewer_rx) = state.hub.attach();
        handle_message(
            &state,
            &viewer,
            ClientMessage::RegisterViewer {
                client_id: "wall-a".to_string(),
                display_name: None,
            },
        )
        .await;
        while viewer_rx.try_recv().is_ok() {}

        let (admin, _admin_rx) = state.hub.attach();
        handle_message(&state, &admin, update_region("wall-a", raw(0.0, 0.0, 640.0, 360.0)))
            .await;

        match viewer_rx.try_recv() {
            Ok(ServerMessage::RegionUpdate {
                client_id, region, ..
            }) => {
                assert_eq!(client_id, "wall-a");
                assert_eq!(region, Some(Rectangle::new(0, 0, 640, 360)));
            }
            other => panic!("expected region-update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_area_region_rejected_with_bad_input() {
        let state = test_state();
        let (admin, mut admin_rx) = state.hub.attach();

        handle_message(&state, &admin, update_region("wall-a", raw(0.0, 0.0, 0.0, 360.0)))
            .await;

        match recv_skipping_roster(&mut admin_rx).await {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "BAD_INPUT"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signaling_from_wrong_role_dropped() {
        let state = test_state();
        let (stranger, _rx) = state.hub.attach();

        // Never registered as broadcaster; the offer must go nowhere.
        let (viewer, mut viewer_rx) = state.hub.attach();
        handle_message(
            &state,
            &viewer,
            ClientMessage::RegisterViewer {
                client_id: "wall-a".to_string(),
                display_name: None,
            },
        )
        .await;
        while viewer_rx.try_recv().is_ok() {}

        handle_message(
            &state,
            &stranger,
            ClientMessage::BroadcasterOffer {
                viewer_transport_id: viewer.clone(),
                sdp: json!({"type": "offer", "sdp": "v=0"}),
            },
        )
        .await;
        assert!(viewer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_viewer_disconnect_notifies_broadcaster() {
        let state = test_state();
        let geometry = StreamGeometry {
            width: 1920,
            height: 1080,
        };

        let (broadcaster, mut broadcaster_rx) = state.hub.attach();
        handle_message(
            &state,
            &broadcaster,
            ClientMessage::RegisterBroadcaster { geometry },
        )
        .await;

        let (viewer, _viewer_rx) = state.hub.attach();
        handle_message(
            &state,
            &viewer,
            ClientMessage::RegisterViewer {
                client_id: "wall-a".to_string(),
                display_name: None,
            },
        )
        .await;
        while broadcaster_rx.try_recv().is_ok() {}

        handle_disconnect(&state, &viewer).await;

        match recv_skipping_roster(&mut broadcaster_rx).await {
            Some(ServerMessage::ViewerDisconnected {
                viewer_transport_id,
            }) => assert_eq!(viewer_transport_id, viewer),
            other => panic!("expected viewer-disconnected, got {:?}", other),
        }

        // Record survives the disconnect
        let record = state.registry.get_viewer("wall-a").await.unwrap().unwrap();
        assert!(!record.connected);
    }
}
