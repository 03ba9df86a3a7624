use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use parley_client_core::config::ClientConfig;
use parley_client_core::gateway::GatewayClient;
use parley_client_core::peer::{IncomingState, OutgoingState, PeerConnector, SecureChannel};
use parley_client_core::rtc::WebRtcFactory;
use parley_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use parley_proto::{Fingerprint, PersonalIdentity, WrappedIdentity};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "parley",
    about = "End-to-end encrypted peer chat over WebRTC",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PARLEY_IDENTITY",
        default_value = "parley-identity.json",
        help = "Path to the password-wrapped identity file"
    )]
    identity: PathBuf,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "PARLEY_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "PARLEY_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new identity and store it wrapped under a password
    Keygen {
        #[arg(long, help = "Replace an existing identity file")]
        force: bool,
    },
    /// Print the fingerprint of the stored identity
    Whoami,
    /// Wait for peer requests and chat with the first accepted peer
    Listen {
        #[arg(
            long = "allow",
            value_name = "FINGERPRINT",
            help = "Only accept requests from this fingerprint (repeatable)"
        )]
        allow: Vec<Fingerprint>,
    },
    /// Request a channel to a peer and chat once it is secured
    Connect {
        #[arg(value_name = "FINGERPRINT")]
        peer: Fingerprint,
    },
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    match cli.command {
        Command::Keygen { force } => keygen(&cli.identity, force),
        Command::Whoami => {
            let identity = load_identity(&cli.identity)?;
            println!("{}", identity.fingerprint());
            Ok(())
        }
        Command::Listen { allow } => listen(&cli.identity, allow).await,
        Command::Connect { peer } => connect(&cli.identity, peer).await,
    }
}

fn password(prompt: &str) -> Result<String> {
    if let Ok(password) = std::env::var("PARLEY_IDENTITY_PASSWORD") {
        return Ok(password);
    }
    rpassword::prompt_password(prompt).context("failed to read password")
}

fn keygen(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    let password = password("New identity password: ")?;
    if password.is_empty() {
        bail!("password must not be empty");
    }
    let identity = PersonalIdentity::generate();
    let wrapped = WrappedIdentity::wrap(&identity, &password).context("failed to wrap identity")?;
    let json = wrapped.to_json().context("failed to encode identity")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    println!("{}", identity.fingerprint());
    Ok(())
}

fn load_identity(path: &Path) -> Result<PersonalIdentity> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}; run `parley keygen` first", path.display()))?;
    let wrapped = WrappedIdentity::from_json(&raw).context("identity file is malformed")?;
    let password = password("Identity password: ")?;
    wrapped
        .unwrap_identity(&password)
        .context("could not unlock identity")
}

async fn connector(identity_path: &Path) -> Result<PeerConnector> {
    let identity = Arc::new(load_identity(identity_path)?);
    let config = ClientConfig::from_env();
    info!(gateway = %config.gateway_url, fingerprint = %identity.fingerprint(), "connecting to gateway");
    let gateway = GatewayClient::connect(&config, identity)
        .await
        .context("failed to reach gateway")?;
    gateway
        .wait_connected()
        .await
        .context("gateway authentication failed")?;
    eprintln!("🔑 {}", gateway.fingerprint());
    Ok(PeerConnector::new(
        gateway,
        Arc::new(WebRtcFactory::new()),
        config,
    ))
}

async fn listen(identity_path: &Path, allow: Vec<Fingerprint>) -> Result<()> {
    let connector = connector(identity_path).await?;
    let mut requests = connector.incoming();
    eprintln!("⏳ waiting for peer requests");

    while let Some(request) = requests.next().await {
        let peer = request.peer();
        if !allow.is_empty() && !allow.contains(&peer) {
            info!(peer = %peer.short(), "rejecting request from unlisted peer");
            if let Err(err) = request.reject().await {
                warn!(peer = %peer.short(), error = %err, "failed to reject request");
            }
            continue;
        }
        eprintln!("📨 request from {peer}");
        request.accept().await.context("failed to accept request")?;
        match request.wait_for_outcome().await {
            IncomingState::Connected => {}
            other => {
                warn!(peer = %peer.short(), state = %other, "accepted request did not connect");
                continue;
            }
        }
        let channel = request.secure().await.context("key exchange failed")?;
        return chat(channel).await;
    }
    bail!("gateway session ended")
}

async fn connect(identity_path: &Path, peer: Fingerprint) -> Result<()> {
    let connector = connector(identity_path).await?;
    let request = connector
        .request(peer)
        .await
        .context("failed to send peer request")?;
    eprintln!("📤 requested {peer}");
    match request.wait_for_outcome().await {
        OutgoingState::Connected => {}
        other => bail!("peer request ended as {other}"),
    }
    let channel = request.secure().await.context("key exchange failed")?;
    chat(channel).await
}

/// Lines from stdin go to the peer; the peer's messages go to stdout.
async fn chat(channel: SecureChannel) -> Result<()> {
    eprintln!("🔒 secure channel up; type to send, ctrl-d to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(err) = channel.send(line.as_bytes()).await {
                        break Err(err).context("send failed");
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(err).context("failed to read stdin"),
            },
            received = channel.recv() => match received {
                Ok(message) => {
                    stdout.write_all(&message).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
                Err(err) => {
                    eprintln!("🔌 channel closed: {err}");
                    break Ok(());
                }
            },
        }
    };
    channel.close().await;
    result
}
