//! Development relay binary.
//!
//! Runs a relay with the permissive [`AcceptAll`] verifier and
//! authenticator: every envelope and every handshake is accepted. Suitable
//! for local development and integration testing only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use agentlink_relay::{AcceptAll, RelayConfig, RelayRuntime};

#[derive(Parser, Debug)]
#[command(name = "agentlink-relay", about = "Agent message relay (dev mode)")]
struct Cli {
    /// Address to listen on for agent connections.
    #[arg(long, env = "AGENTLINK_LISTEN", default_value = "127.0.0.1:4300")]
    listen: SocketAddr,

    /// Path for the durable offline queue. Omit for an in-memory queue.
    #[arg(long, env = "AGENTLINK_QUEUE_PATH")]
    queue_path: Option<PathBuf>,

    /// Queued message TTL in seconds.
    #[arg(long, env = "AGENTLINK_MESSAGE_TTL_SECS", default_value_t = 604_800)]
    message_ttl_secs: u64,

    /// Heartbeat age in seconds beyond which a session is evicted.
    #[arg(long, env = "AGENTLINK_PING_TIMEOUT_SECS", default_value_t = 90)]
    ping_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig {
        listen_tcp: cli.listen,
        queue_path: cli.queue_path,
        message_ttl_secs: cli.message_ttl_secs,
        ping_timeout_secs: cli.ping_timeout_secs,
        ..Default::default()
    };

    tracing::warn!(
        "running with AcceptAll verification and authentication; do not expose beyond loopback"
    );

    let mut runtime = RelayRuntime::new(config, Arc::new(AcceptAll), Arc::new(AcceptAll))?;
    let addr = runtime.start().await?;
    tracing::info!(addr = %addr, "relay running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    runtime.shutdown();
    Ok(())
}
