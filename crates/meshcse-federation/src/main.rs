#![warn(missing_docs)]

//! `cse-node`: runs the federation subsystem of one node until interrupted.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use meshcse_federation::{
    Federation, FederationConfig, HttpTransport, HttpTransportConfig, MemoryStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "cse-node")]
#[command(about = "meshcse node: registration, announcement and transit routing", long_about = None)]
struct Cli {
    /// Node configuration (TOML or JSON).
    #[arg(short, long, env = "MESHCSE_CONFIG", default_value = "/etc/meshcse/node.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = if cli.config.exists() {
        FederationConfig::from_file(&cli.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        FederationConfig::default()
    };
    tracing::info!(
        node = %config.cse_id,
        node_type = %config.node_type,
        "meshcse node starting"
    );

    let store = Arc::new(MemoryStore::with_base(config.base_resource()));
    let transport = Arc::new(HttpTransport::new(HttpTransportConfig {
        request_timeout: config.request_timeout(),
        release_version: config
            .supported_releases
            .last()
            .cloned()
            .unwrap_or_else(|| "3".to_string()),
    })?);

    let federation = Federation::new(config, store, transport)?;
    federation.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    federation.stop().await;
    Ok(())
}
