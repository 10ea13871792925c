//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// WebRTC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Upper bound on ICE gathering before the answer is sent anyway (ms)
    pub gathering_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough on a LAN; configure STUN/TURN for remote viewers
            stun_servers: vec![],
            turn_servers: vec![],
            bitrate_kbps: 2000,
            gathering_timeout_ms: 5000,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: WebRtcConfig =
            serde_json::from_str(r#"{"stun_servers":["stun:stun.l.google.com:19302"]}"#).unwrap();
        assert_eq!(config.stun_servers.len(), 1);
        assert_eq!(config.bitrate_kbps, 2000);
        assert!(config.turn_servers.is_empty());
    }
}
