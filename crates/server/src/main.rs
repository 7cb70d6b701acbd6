use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod nodes;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(about = "Trellis - workflow execution service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis=info,tower_http=debug".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("starting trellis workflow service");
    tracing::info!("data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await?;

    Ok(())
}
