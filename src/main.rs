//! WebSocket adapter
//!
//! Run with: cargo run --bin ws-adapter -- [--config <path>]
//!
//! # Configuration
//!
//! Read from `--config`, else the first existing default location, then
//! overridden by environment variables:
//! - `MF_WS_ADAPTER_PORT`: Port to listen on (default: 8180)
//! - `MF_NATS_URL`: Broker URL (default: nats://localhost:4222)
//! - `MF_THINGS_URL`: Authorization service (default: localhost:8181)
//! - `MF_WS_ADAPTER_CLIENT_TLS`: TLS towards the authorization service (default: false)
//! - `MF_WS_ADAPTER_CA_CERTS`: CA bundle for that TLS link (default: none)
//! - `MF_WS_ADAPTER_LOG_LEVEL`: Log level (default: error)
//! - `RUST_LOG`: Full filter directive, takes precedence over the log level

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ws_adapter::api::{serve, AppState};
use ws_adapter::auth::HttpAuthority;
use ws_adapter::broker::{InMemoryBroker, NatsBroker, PubSub};
use ws_adapter::config::{generate_default_config, BrokerKind, Config, LoggingConfig};
use ws_adapter::envelope::EnvelopeCodec;

#[derive(Parser)]
#[command(name = "ws-adapter")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket adapter for the IoT message broker")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a default configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    init_tracing(&config.logging);

    if let Err(e) = run(config).await {
        tracing::error!("WebSocket adapter terminated: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let codec = EnvelopeCodec::new(config.limits.codec());

    let broker: Arc<dyn PubSub> = match config.broker.kind {
        BrokerKind::Nats => Arc::new(
            NatsBroker::connect(config.broker.nats(), codec)
                .await
                .with_context(|| format!("Failed to connect to NATS at {}", config.broker.url))?,
        ),
        BrokerKind::Memory => {
            tracing::warn!("Using the in-process broker; messages stay inside this adapter");
            Arc::new(InMemoryBroker::new(codec))
        }
    };

    let authority = HttpAuthority::new(&config.auth).context("Failed to set up authorization client")?;
    authority
        .health_check()
        .await
        .with_context(|| format!("Authorization service unreachable at {}", authority.base_url()))?;

    let recorder = ws_adapter::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let state = AppState::new(&config, Arc::new(authority), broker).with_metrics(recorder);
    serve(state).await?;

    tracing::info!("WebSocket adapter stopped");
    Ok(())
}

/// Initialize tracing: `RUST_LOG` wins, else the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("error"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
