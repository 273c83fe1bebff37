use anyhow::{Context, Result};
use clap::Parser;
use extension_preview::{init_tracing, PreviewConfig};
use tracing::{error, info};

use super::dispatch::dispatch;
use super::env::CliArgs;

pub async fn run() -> Result<()> {
    let cli = CliArgs::parse();

    let mut config = PreviewConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    config.log.json |= cli.json_logs;
    let _log_guard = init_tracing(&config.log).context("Failed to initialise logging")?;

    info!("Starting extension-preview v{}", env!("CARGO_PKG_VERSION"));

    match dispatch(&cli, config).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("Command failed: {:#}", err);
            Err(err)
        }
    }
}
