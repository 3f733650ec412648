use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PAIRBENCH_LOG";

pub fn log_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Could not determine data directory")?;
    Ok(base.join("pairbench").join("pairbench.log"))
}

/// Sends tracing output to the log file; the terminal belongs to the UI.
/// `PAIRBENCH_LOG` overrides the configured level.
pub fn init(level: &str) -> Result<PathBuf> {
    let path = log_path()?;
    crate::config::ensure_parent_dir(&path)?;
    let file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;
    Ok(path)
}
