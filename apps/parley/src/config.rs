use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use crate::rtc::RtcConfig;

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:8080/ws";

/// Parley client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the gateway
    pub gateway_url: String,
    /// Bound on each step of the gateway challenge handshake
    pub auth_timeout: Duration,
    /// How long an outgoing peer request waits for the target to answer
    pub peer_request_timeout: Duration,
    /// Bound on the whole OTR key exchange
    pub ake_timeout: Duration,
    pub rtc: RtcConfig,
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gateway_url = env::var("PARLEY_GATEWAY_URL")
            .map(|url| normalize_gateway_url(&url))
            .unwrap_or(defaults.gateway_url);
        Self {
            gateway_url,
            auth_timeout: duration_ms("PARLEY_AUTH_TIMEOUT_MS").unwrap_or(defaults.auth_timeout),
            peer_request_timeout: duration_ms("PARLEY_PEER_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.peer_request_timeout),
            ake_timeout: duration_ms("PARLEY_AKE_TIMEOUT_MS").unwrap_or(defaults.ake_timeout),
            rtc: RtcConfig::from_env(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            auth_timeout: Duration::from_secs(5),
            peer_request_timeout: Duration::from_secs(10),
            ake_timeout: Duration::from_secs(10),
            rtc: RtcConfig::default(),
        }
    }
}

fn duration_ms(var: &str) -> Option<Duration> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            tracing::warn!(var, value = %raw, "ignoring invalid duration");
            None
        }
    }
}

/// Dials `localhost` as 127.0.0.1, the loopback address the gateway binds by default.
fn normalize_gateway_url(url: &str) -> String {
    url.replacen("://localhost:", "://127.0.0.1:", 1)
}
