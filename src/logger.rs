use tracing_subscriber::{fmt, EnvFilter, prelude::*};
use anyhow::Result;
use crate::config::settings::LoggingConfig;

/// Every component (SE, BP, SM, IP, HSE, RD) instruments its own
/// `#[tracing::instrument]` spans and `tracing::{info,warn,error,debug}!`
/// call sites directly, tagged by module path rather than a wrapper struct;
/// this just installs the process-wide subscriber those calls write through.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer());

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global subscriber: {}", e))?;

    Ok(())
}
