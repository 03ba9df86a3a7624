use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// Configuration for one RTC negotiation channel.
#[derive(Clone, Debug)]
pub struct RtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Label of the pre-negotiated data channel
    pub data_channel_label: String,
    /// Stream id both sides agree on for the data channel
    pub data_channel_id: u16,
    /// How long a channel may stay CONNECTING before it is closed
    pub open_timeout: Duration,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN.to_string()],
                ..Default::default()
            }],
            data_channel_label: "parley".to_string(),
            data_channel_id: 0,
            open_timeout: Duration::from_secs(30),
        }
    }
}

impl RtcConfig {
    /// Host candidates only; no STUN or TURN.
    pub fn host_only() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    /// Honours `PARLEY_DISABLE_STUN`.
    pub fn from_env() -> Self {
        match std::env::var("PARLEY_DISABLE_STUN") {
            Ok(value) if value != "0" && !value.is_empty() => Self::host_only(),
            _ => Self::default(),
        }
    }

    pub fn with_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn with_turn_server(mut self, urls: Vec<String>, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN.to_string()]);
        assert_eq!(config.data_channel_id, 0);
    }

    #[test]
    fn turn_servers_are_appended_to_host_only() {
        let config = RtcConfig::host_only().with_turn_server(
            vec!["turn:turn.example.org:3478".into()],
            "user".into(),
            "secret".into(),
        );
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "user");
    }
}
