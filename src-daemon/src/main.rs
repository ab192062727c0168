mod cli;
mod runtime;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use mailhop_config::{ConfigManager, LoggingConfig};
use runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::from_path(path),
        None => ConfigManager::new(),
    }
    .context("initialize config manager")?;
    let config = config_manager.load().context("load config")?;
    config.validate().context("validate config")?;

    init_tracing(&config.logging);
    tracing::info!(config = %config_manager.config_path().display(), "configuration loaded");

    let runtime = Runtime::initialize(config_manager, config).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(err) => tracing::error!("failed to listen for ctrl-c: {err}"),
            }
            cancel.cancel();
        });
    }

    runtime.run(cli.command, cancel).await?;
    tracing::info!("shutdown complete");
    Ok(())
}
