pub mod access;
pub mod config;
pub mod status;
pub mod tools;
pub mod up;
pub mod verify;

use anyhow::Context;
use stackup_core::config::{Config, WarnLevel};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Returned when a shutdown signal cut the run short. `main` maps it to
/// exit code 130.
#[derive(Debug)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("interrupted by signal")
    }
}

impl std::error::Error for Interrupted {}

/// Load the config and log its warnings. Validation errors stop the command.
pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();
    for w in &warnings {
        warn!(level = ?w.level, "{}", w.message);
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("invalid configuration; run `stackup config check` for details");
    }
    Ok(config)
}

/// The whole pipeline is sequential; one thread is enough.
pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}
