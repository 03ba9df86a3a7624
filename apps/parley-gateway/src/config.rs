use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::router::DEFAULT_REQUEST_TTL;

/// Settings the per-socket handlers read at runtime.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub challenge_timeout: Duration,
    /// How long an unanswered peer request is kept.
    pub request_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            challenge_timeout: Duration::from_secs(5),
            request_ttl: DEFAULT_REQUEST_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "parley-gateway",
    author,
    version,
    about = "Relay that authenticates parley identities and routes peer signaling"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "PARLEY_GATEWAY_LISTEN_ADDR",
        default_value = "127.0.0.1:8080"
    )]
    pub listen_addr: String,

    /// Seconds a client has to answer its identity challenge.
    #[arg(
        long,
        env = "PARLEY_GATEWAY_CHALLENGE_TIMEOUT_SECS",
        default_value_t = 5
    )]
    pub challenge_timeout_secs: u64,

    /// Seconds an unanswered peer request stays routable.
    #[arg(long, env = "PARLEY_GATEWAY_REQUEST_TTL_SECS", default_value_t = 30)]
    pub request_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PARLEY_GATEWAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.challenge_timeout_secs == 0 {
            anyhow::bail!("challenge timeout must be greater than zero");
        }
        if cli.request_ttl_secs == 0 {
            anyhow::bail!("request ttl must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            gateway: GatewayConfig {
                challenge_timeout: Duration::from_secs(cli.challenge_timeout_secs),
                request_ttl: Duration::from_secs(cli.request_ttl_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_convert() {
        let cli = Cli::try_parse_from(["parley-gateway"]).unwrap();
        let config = ServerConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.gateway.challenge_timeout, Duration::from_secs(5));
        assert_eq!(config.gateway.request_ttl, Duration::from_secs(30));
    }

    #[test]
    fn bad_listen_addr_is_reported() {
        let cli = Cli::try_parse_from(["parley-gateway", "--listen-addr", "nowhere"]).unwrap();
        let err = ServerConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test]
    fn zero_challenge_timeout_is_rejected() {
        let cli =
            Cli::try_parse_from(["parley-gateway", "--challenge-timeout-secs", "0"]).unwrap();
        assert!(ServerConfig::try_from(cli).is_err());
    }

    #[test]
    fn zero_request_ttl_is_rejected() {
        let cli = Cli::try_parse_from(["parley-gateway", "--request-ttl-secs", "0"]).unwrap();
        let err = ServerConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("request ttl"));
    }
}
