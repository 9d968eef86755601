use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use fieldgate::Engine;
use fieldgate::config::GatewayConfig;
use fieldgate::logging::init_logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the JSON configuration file
    #[arg(short, long, env = "FIELDGATE_CONFIG", default_value = "fieldgate.json")]
    config: PathBuf,

    /// Override the data folder of the configuration
    #[arg(long, env = "FIELDGATE_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    /// Override the log directory of the configuration
    #[arg(long, env = "FIELDGATE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = GatewayConfig::load(&args.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
    if let Some(data_folder) = args.data_folder {
        config = config.with_data_folder(data_folder);
    }
    if let Some(log_dir) = args.log_dir {
        config.engine.log_dir = log_dir;
    }

    let (logging, _guard) =
        init_logging(&config.engine.log_dir, config.engine.log_filter.as_deref())
            .context("Failed to initialize logging")?;
    let cancel_token = CancellationToken::new();
    let cleanup = logging.start_retention_cleanup(cancel_token.child_token());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        filter = %logging.get_filter(),
        "Starting fieldgate"
    );

    let engine = Engine::start(&config).await.context("Failed to start engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    engine.stop().await;
    cancel_token.cancel();
    cleanup.await.ok();
    Ok(())
}
