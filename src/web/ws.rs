//! WebSocket transport between the hub and each participant
//!
//! One socket is one participant: it gets a transport id and a bounded
//! outbound FIFO on attach. Inbound frames are parsed and dispatched;
//! malformed frames are dropped with a warning and change no state. When
//! the hub closes the participant (backlog overflow, broadcaster
//! replacement) the outbound channel ends and the socket is shut down.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::hub::dispatch;
use crate::messages::ClientMessage;
use crate::state::AppState;

/// Keep-alive ping interval
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler for `/api/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (transport_id, mut outbound) = state.hub.attach();

    info!(transport_id = %transport_id, "Participant connected");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                dispatch::handle_message(&state, &transport_id, msg).await;
                            }
                            Err(e) => {
                                warn!(
                                    transport_id = %transport_id,
                                    error = %e,
                                    "Dropping malformed message"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        debug!(transport_id = %transport_id, "Heartbeat frame");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(transport_id = %transport_id, "Participant closed the socket");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(transport_id = %transport_id, error = %e, "Socket receive error");
                        break;
                    }
                    _ => {}
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize outbound message");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Hub-side close: backlog overflow or forced
                        // replacement.
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    dispatch::handle_disconnect(&state, &transport_id).await;
    info!(transport_id = %transport_id, "Participant disconnected");
}
