//! Pledge ledger reconciler: entry point.
//!
//! Replays the pledge contract's `Transfer` / `CancelProject` history over
//! the stored donation records, reports every divergence, and optionally
//! writes the corrections back.

mod amount;
mod cancel;
mod chain;
mod config;
mod db;
mod detect;
mod donation;
mod errors;
mod events;
mod index;
mod matching;
mod reconcile;
mod repair;
mod report;
mod rpc;
mod source;
mod state;
mod status;
mod tokens;

use std::path::{Path, PathBuf};

use clap::Parser;
use reqwest::Client;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use config::Config;
use reconcile::RunOptions;

#[derive(Debug, Parser)]
#[command(
    name = "reconciler",
    version,
    about = "Reconcile donation records against pledge ledger events"
)]
struct Cli {
    /// Only report conflicts; never write to the store.
    #[arg(long)]
    dry_run: bool,

    /// Fetch the latest snapshot and new events before replaying.
    #[arg(long)]
    update_network_cache: bool,

    /// Override CACHE_DIR.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Write logs to daily-rotating files in this directory instead of stdout.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Debug logging when RUST_LOG is not set.
    #[arg(long)]
    debug: bool,

    /// Override REPORT_PATH.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Flushes the log file on drop; must outlive the run.
    let _log_guard = init_tracing(cli.debug, cli.log_dir.as_deref())?;

    let mut config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(path) = cli.report {
        config.report_path = Some(path);
    }

    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let options = RunOptions {
        apply: !cli.dry_run,
        update_cache: cli.update_network_cache,
    };
    info!(
        "Reconciling {} ({})",
        config.liquid_pledging_address,
        if options.apply { "fixing conflicts" } else { "dry run" }
    );

    let report = reconcile::run(&config, &pool, client, options).await?;
    report.log_summary();
    if let Some(path) = &config.report_path {
        report.write(path)?;
    }

    Ok(())
}

/// Log to stdout, or to `simulation-error.<date>.log` in `log_dir` rotated
/// daily with 30 files kept. RUST_LOG wins over `debug`.
fn init_tracing(debug: bool, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };
    let (writer, guard) = tracing_appender::non_blocking(log_file(dir)?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn log_file(dir: &Path) -> anyhow::Result<RollingFileAppender> {
    Ok(rolling::Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("simulation-error")
        .filename_suffix("log")
        .max_log_files(30)
        .build(dir)?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn log_dir_flag_is_optional() {
        let cli = Cli::try_parse_from(["reconciler", "--dry-run"]).unwrap();
        assert!(cli.dry_run);
        assert!(cli.log_dir.is_none());

        let cli = Cli::try_parse_from(["reconciler", "--log-dir", "/var/log/reconciler"]).unwrap();
        assert_eq!(cli.log_dir, Some(PathBuf::from("/var/log/reconciler")));
    }

    #[test]
    fn log_file_is_dated_in_the_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = log_file(dir.path()).unwrap();
        appender.write_all(b"conflict\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("simulation-error."));
        assert!(names[0].ends_with(".log"));
    }
}
