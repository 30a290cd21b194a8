//! HTTP router: WebSocket endpoint, health check, admin static assets

use std::sync::Arc;

use axum::{
    routing::{any, get},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/ws", any(ws_handler))
        .with_state(state.clone());

    // The admin web surface ships as static assets from a sibling path.
    let static_files = ServeDir::new(&state.config.static_dir);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_files)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "success": true,
        "service": "wallcast",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
