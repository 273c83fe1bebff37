use anyhow::Result;
use extension_preview::PreviewConfig;

use super::commands::Commands;
use super::env::CliArgs;
use super::inject::cmd_inject;
use super::inspect::cmd_inspect;

pub async fn dispatch(cli: &CliArgs, config: PreviewConfig) -> Result<()> {
    match cli.command.clone() {
        Commands::Inspect(args) => cmd_inspect(args, cli.output).await,
        Commands::Inject(args) => cmd_inject(args, config, cli.output).await,
    }
}
