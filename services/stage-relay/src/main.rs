//! Stage relay binary entry point
//!
//! Runs the WebSocket presence relay that stage-mesh participants use for
//! signaling. The relay only tracks session membership and forwards
//! envelopes; media never passes through it.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:8080)
//! cargo run -p stage-relay
//!
//! # Custom address, JSON logs
//! STAGE_RELAY_BIND=127.0.0.1:9000 cargo run -p stage-relay -- --log-json
//! ```

use anyhow::Context;
use clap::Parser;
use stage_mesh::RelayServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stage mesh signaling relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "STAGE_RELAY_BIND")]
    bind: String,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "STAGE_RELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        "Stage relay starting"
    );

    let server = RelayServer::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind relay to {}", args.bind))?;
    let handle = server.start()?;
    info!(url = %handle.url(), "Stage relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown signal received, stopping relay...");

    let sessions = handle.state().session_count().await;
    handle.shutdown().await;
    info!(open_sessions = sessions, "Stage relay shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,stage_mesh=debug"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
