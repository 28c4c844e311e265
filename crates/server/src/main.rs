use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod runners;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "stepgraph")]
#[command(about = "Execution-graph engine for multi-step plans", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "STEPGRAPH_CONFIG", default_value = "stepgraph.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, env = "STEPGRAPH_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "STEPGRAPH_PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "STEPGRAPH_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stepgraph=info,stepgraph_core=info,stepgraph_server=info,tower_http=debug".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = ServerConfig::load(&args.config, args.data_dir.clone())?;

    init_tracing(args.log_json || config.logging.json);

    tracing::info!("Starting stepgraph {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Data directory: {}", args.data_dir.display());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config, shutdown).await?;

    tracing::info!("Stopped");
    Ok(())
}
