//! Hub configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::webrtc::WebRtcConfig;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;
/// Default stale viewer record TTL in seconds (30 minutes)
pub const DEFAULT_STALE_TTL_SECS: u64 = 1800;
/// Default region-update coalescing window in milliseconds
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 50;
/// Default per-participant outbound queue capacity
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
/// Default pending ICE candidate queue capacity per viewer session
pub const DEFAULT_PENDING_ICE_CAPACITY: usize = 64;
/// Default SDP offer answer timeout in seconds
pub const DEFAULT_OFFER_TIMEOUT_SECS: u64 = 15;
/// Default (and maximum) cropped track output frame rate
pub const DEFAULT_MAX_OUTPUT_FPS: u32 = 30;

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Listen address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// Disconnected viewer records older than this are garbage-collected
    pub stale_ttl_seconds: u64,
    /// Window for coalescing per-viewer region-change notifications
    pub coalesce_window_ms: u64,
    /// Outbound message queue capacity per participant; overflow closes the
    /// participant's transport
    pub outbound_queue_capacity: usize,
    /// ICE candidates buffered per viewer session before the answer arrives;
    /// overflow drops the oldest
    pub pending_ice_capacity: usize,
    /// How long a session waits in OfferSent before being torn down
    pub offer_timeout_seconds: u64,
    /// Frame rate cap for cropped output tracks
    pub max_output_fps: u32,
    /// Directory the admin web surface is served from
    pub static_dir: PathBuf,
    /// WebRTC settings for broadcaster-side peer connections
    pub webrtc: WebRtcConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            stale_ttl_seconds: DEFAULT_STALE_TTL_SECS,
            coalesce_window_ms: DEFAULT_COALESCE_WINDOW_MS,
            outbound_queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            pending_ice_capacity: DEFAULT_PENDING_ICE_CAPACITY,
            offer_timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECS,
            max_output_fps: DEFAULT_MAX_OUTPUT_FPS,
            static_dir: PathBuf::from("admin"),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_seconds)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_seconds)
    }

    /// Output frame rate, clamped to the 30 fps contract ceiling.
    pub fn output_fps(&self) -> u32 {
        self.max_output_fps.clamp(1, DEFAULT_MAX_OUTPUT_FPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = HubConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.stale_ttl(), Duration::from_secs(1800));
        assert_eq!(config.coalesce_window(), Duration::from_millis(50));
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.pending_ice_capacity, 64);
        assert_eq!(config.offer_timeout(), Duration::from_secs(15));
        assert_eq!(config.output_fps(), 30);
    }

    #[test]
    fn test_output_fps_is_capped() {
        let config = HubConfig {
            max_output_fps: 120,
            ..Default::default()
        };
        assert_eq!(config.output_fps(), 30);
    }
}
