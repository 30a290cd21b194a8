//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// WebRTC configuration
///
/// STUN-only: the contract requires no TURN relay provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Empty for local deployments - host candidates work directly.
            // For remote viewers, configure STUN via --stun-server.
            stun_servers: vec![],
        }
    }
}
