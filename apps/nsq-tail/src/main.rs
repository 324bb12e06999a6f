//! nsq-tail entry point.

mod app;
mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting nsq-tail");

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::info!(
        mode = ?config.mode,
        topic = %config.topic,
        nsqd = config.nsqd_addresses.len(),
        lookupd = config.lookupd_urls.len(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("nsq-tail shut down cleanly");
    Ok(())
}
