//! Peer connection construction

use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::WebRtcConfig;
use crate::error::{AppError, Result};

/// Build a peer connection with the default codec set and interceptors.
pub async fn build_peer_connection(config: &WebRtcConfig) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| AppError::Negotiation(format!("Failed to register codecs: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| AppError::Negotiation(format!("Failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await
        .map_err(|e| AppError::Negotiation(format!("Failed to create peer connection: {}", e)))?;

    Ok(Arc::new(pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_peer_connection_offline() {
        let pc = build_peer_connection(&WebRtcConfig::default()).await.unwrap();
        // SDP creation needs no network
        let offer = pc.create_offer(None).await.unwrap();
        assert!(offer.sdp.starts_with("v=0"));
        pc.close().await.unwrap();
    }
}
