use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub theme: String,
    pub session_minutes: u64,
    pub file_list_width: u16,
    pub chat_width_percent: u16,
    pub tab_width: usize,
    pub snapshot_extensions: Vec<String>,
    pub mock_latency_ms: u64,
    pub mock_failure_rate: f64,
    pub log_level: String,
    pub theme_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: "base16-ocean.dark".to_string(),
            session_minutes: 45,
            file_list_width: 24,
            chat_width_percent: 40,
            tab_width: 4,
            snapshot_extensions: ["py", "md", "toml", "cfg", "txt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mock_latency_ms: 600,
            mock_failure_rate: 0.0,
            log_level: "info".to_string(),
            theme_dir: dirs::config_dir().map(|dir| dir.join("pairbench").join("themes")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PartialConfig {
    theme: Option<String>,
    session_minutes: Option<u64>,
    file_list_width: Option<u16>,
    chat_width_percent: Option<u16>,
    tab_width: Option<usize>,
    snapshot_extensions: Option<Vec<String>>,
    mock_latency_ms: Option<u64>,
    mock_failure_rate: Option<f64>,
    log_level: Option<String>,
    theme_dir: Option<PathBuf>,
}

fn fill<T>(value: Option<T>, default: T, changed: &mut bool) -> T {
    match value {
        Some(v) => v,
        None => {
            *changed = true;
            default
        }
    }
}

impl PartialConfig {
    fn apply_defaults(self) -> (Config, bool) {
        let defaults = Config::default();
        let mut changed = false;

        (
            Config {
                theme: fill(self.theme, defaults.theme, &mut changed),
                session_minutes: fill(self.session_minutes, defaults.session_minutes, &mut changed)
                    .max(1),
                file_list_width: fill(self.file_list_width, defaults.file_list_width, &mut changed),
                chat_width_percent: fill(
                    self.chat_width_percent,
                    defaults.chat_width_percent,
                    &mut changed,
                )
                .clamp(20, 80),
                tab_width: fill(self.tab_width, defaults.tab_width, &mut changed),
                snapshot_extensions: fill(
                    self.snapshot_extensions,
                    defaults.snapshot_extensions,
                    &mut changed,
                ),
                mock_latency_ms: fill(self.mock_latency_ms, defaults.mock_latency_ms, &mut changed),
                mock_failure_rate: fill(
                    self.mock_failure_rate,
                    defaults.mock_failure_rate,
                    &mut changed,
                ),
                log_level: fill(self.log_level, defaults.log_level, &mut changed),
                theme_dir: fill(self.theme_dir.map(Some), defaults.theme_dir, &mut changed),
            },
            changed,
        )
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("pairbench").join("config.toml"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        write_config_to(path, &cfg)?;
        return Ok(cfg);
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let partial: PartialConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let (cfg, changed) = partial.apply_defaults();
    if changed {
        write_config_to(path, &cfg)?;
    }
    Ok(cfg)
}

fn write_config_to(path: &Path, cfg: &Config) -> Result<()> {
    ensure_parent_dir(path)?;
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_config_in_editor() -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        write_config_to(&path, &Config::default())?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "nvim".to_string());
    let mut parts = match shell_words::split(&editor) {
        Ok(p) if !p.is_empty() => p,
        _ => vec![editor],
    };
    let cmd = parts.remove(0);
    let status = Command::new(cmd)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor for {}", path.display()))?;
    if !status.success() {
        anyhow::bail!("Editor exited with status {}", status);
    }
    Ok(())
}
