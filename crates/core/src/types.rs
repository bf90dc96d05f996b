//! Shared signaling-facing types

use serde::{Deserialize, Serialize};

/// Participant call-state flags as reported by the HPB in `inCall` fields.
pub mod call_flag {
    pub const DISCONNECTED: u32 = 0;
    pub const IN_CALL: u32 = 1;
    pub const WITH_AUDIO: u32 = 2;
    pub const WITH_VIDEO: u32 = 4;
    pub const WITH_PHONE: u32 = 8;
}

/// Result of one signaling connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigConnectResult {
    Success,
    /// Terminal; do not retry.
    Failure,
    /// A reconnect has been scheduled or the caller may retry.
    Retry,
}

/// How to (re-)establish the signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMethod {
    /// First connection for this room.
    Fresh,
    /// Resume the previous session with its resume id.
    ShortResume,
    /// Drop all per-connection state and authenticate from scratch.
    FullReconnect,
}

/// STUN server entry from the signaling settings payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StunServer {
    pub urls: Vec<String>,
}

/// TURN server entry from the signaling settings payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Settings received from the Nextcloud signaling settings endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HpbSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub stunservers: Vec<StunServer>,
    #[serde(default)]
    pub turnservers: Vec<TurnServer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_flags_match_wire_values() {
        assert_eq!(call_flag::DISCONNECTED, 0);
        assert_eq!(call_flag::IN_CALL | call_flag::WITH_AUDIO, 3);
        assert_eq!(call_flag::WITH_VIDEO, 4);
        assert_eq!(call_flag::WITH_PHONE, 8);
    }

    #[test]
    fn hpb_settings_deserialize_with_defaults() {
        let settings: HpbSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.stunservers.is_empty());
        assert!(settings.turnservers.is_empty());

        let settings: HpbSettings = serde_json::from_str(
            r#"{
                "server": "wss://hpb.example.org",
                "stunservers": [{"urls": ["stun:stun.example.org:443"]}],
                "turnservers": [{
                    "urls": ["turn:turn.example.org:443?transport=udp"],
                    "username": "u",
                    "credential": "c"
                }]
            }"#,
        )
        .unwrap();
        assert_eq!(settings.stunservers.len(), 1);
        assert_eq!(settings.turnservers[0].username, "u");
    }
}
