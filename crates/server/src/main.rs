use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "runloom")]
#[command(about = "Workflow run engine - DAG orchestration over typed connectors", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RUNLOOM_CONFIG", default_value = "runloom.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, env = "RUNLOOM_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "RUNLOOM_PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "RUNLOOM_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "runloom=info,tower_http=debug".into());
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

    init_tracing(args.log_json);

    tracing::info!("Starting Runloom run engine");
    tracing::info!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
