mod app;
mod backend;
mod chat;
mod config;
mod inline;
mod logging;
mod render;
mod session;
mod snapshot;
mod theme;
mod view;
mod workspace;

use anyhow::{Context, Result};
use backend::{BackendWorker, MockBackend};
use clap::{Parser, Subcommand};
use render::RenderContext;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "pairbench", version, about = "Pair-programming assessment workbench")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Candidate name shown in the status line and report
    #[arg(long, default_value = "candidate")]
    candidate: String,

    /// Load the snapshot from a directory instead of the built-in one
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Session length in minutes (overrides the config)
    #[arg(long)]
    minutes: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the config file in $EDITOR (default: nvim)
    Config,
    /// List available themes
    Themes,
    /// Print the render blocks of a markdown file
    Render {
        file: PathBuf,
        /// Paths treated as known workspace files (default: the built-in snapshot)
        #[arg(long)]
        known: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Commands::Config => return config::open_config_in_editor(),
            Commands::Themes => {
                let cfg = config::load_config()?;
                let manager = theme::ThemeManager::load(&cfg)?;
                for name in manager.theme_names() {
                    println!("{name}");
                }
                return Ok(());
            }
            Commands::Render { file, known } => return render_file(&file, known),
        }
    }

    let cfg = config::load_config()?;
    let log_path = logging::init(&cfg.log_level)?;
    info!(log = %log_path.display(), "pairbench starting");

    let workspace = match &cli.snapshot {
        Some(dir) => snapshot::load_dir(dir, &cfg.snapshot_extensions)?,
        None => snapshot::builtin(),
    };
    let minutes = cli.minutes.unwrap_or(cfg.session_minutes).max(1);

    let backend = MockBackend::new(
        Duration::from_millis(cfg.mock_latency_ms),
        cfg.mock_failure_rate,
    );
    let worker = BackendWorker::new(Arc::new(backend));
    let info = worker
        .backend()
        .start_session(&cli.candidate, session_duration(minutes))
        .context("Failed to start session")?;

    app::run_app(info, workspace, worker, cfg)
}

fn session_duration(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn render_file(file: &Path, known: Vec<String>) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let known: BTreeSet<String> = if known.is_empty() {
        snapshot::builtin().paths().map(str::to_string).collect()
    } else {
        known.into_iter().collect()
    };
    let blocks = render::render_message(&content, &RenderContext::new(&known));
    for block in &blocks {
        println!("{}", block.summary());
    }
    let code_blocks = blocks.iter().filter(|b| b.is_code()).count();
    let applicable = blocks.iter().filter(|b| b.apply_target().is_some()).count();
    let code_lines: usize = blocks
        .iter()
        .filter_map(|b| b.code())
        .map(|c| c.content.lines().count())
        .sum();
    println!(
        "{} blocks, {code_blocks} code ({code_lines} lines), {applicable} applicable",
        blocks.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::session_duration;
    use std::time::Duration;

    #[test]
    fn huge_minute_counts_saturate() {
        assert_eq!(session_duration(45), Duration::from_secs(2700));
        assert_eq!(session_duration(u64::MAX), Duration::from_secs(u64::MAX));
    }
}
