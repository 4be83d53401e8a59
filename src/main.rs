//! `organize <source> <destination> <ledger-endpoint> <ledger-database>`

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail, ensure};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use media_organizer::config::Configuration;
use media_organizer::ledger::{LedgerClient, MemoryLedger, SqliteLedger};
use media_organizer::paths::validate_component;
use media_organizer::tasks::ingest::{DirectoryState, IngestPipeline, IngestReport};
use media_organizer::tasks::transfer::FileOutcome;

/// Ledger endpoint that keeps everything in process memory.
const MEMORY_ENDPOINT: &str = "memory";

#[derive(Debug, Parser)]
#[command(
    name = "organize",
    version,
    about = "Copy a media tree into YEAR/MONTH/DAY/EXT folders and record every file in a ledger"
)]
struct Args {
    /// Directory to ingest
    #[arg(value_name = "SOURCE")]
    source: PathBuf,
    /// Destination root (created if missing)
    #[arg(value_name = "DESTINATION")]
    destination: PathBuf,
    /// Directory holding ledger databases, or `memory`
    #[arg(value_name = "LEDGER_ENDPOINT")]
    ledger_endpoint: String,
    /// Ledger database name inside the endpoint
    #[arg(value_name = "LEDGER_DATABASE")]
    ledger_database: String,

    /// Path to YAML config
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Concurrent transfers per directory (overrides `workers`)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Print incomplete ledger records as JSON lines and exit
    #[arg(long)]
    list_pending: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) -> Result<()> {
    // map -v to log level
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("media_organizer={level}").parse()?)
        .add_directive(format!("organize={level}").parse()?);
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn load_config(args: &Args) -> Result<Configuration> {
    let mut cfg = match &args.config {
        Some(path) => Configuration::from_yaml_file(path)?,
        None => Configuration::default(),
    };
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    cfg.validated().context("invalid configuration values")
}

/// The source must be a readable directory; a missing destination is created.
fn validate_roots(source: &Path, destination: &Path) -> Result<()> {
    ensure!(
        source.is_dir(),
        "source {} is not a directory",
        source.display()
    );
    fs::read_dir(source).with_context(|| format!("source {} is not readable", source.display()))?;

    if !destination.exists() {
        info!(path = %destination.display(), "creating destination root");
        fs::create_dir_all(destination)
            .with_context(|| format!("failed to create destination {}", destination.display()))?;
    }
    ensure!(
        destination.is_dir(),
        "destination {} is not a directory",
        destination.display()
    );
    Ok(())
}

fn open_ledger(endpoint: &str, database: &str, cfg: &Configuration) -> Result<Arc<dyn LedgerClient>> {
    if endpoint == MEMORY_ENDPOINT {
        warn!("using the in-memory ledger; nothing is persisted");
        return Ok(Arc::new(MemoryLedger::new()));
    }
    validate_component(database).context("invalid ledger database name")?;
    let dir = PathBuf::from(endpoint);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create ledger endpoint {}", dir.display()))?;
    let path = dir.join(format!("{database}.sqlite3"));
    let ledger = SqliteLedger::open(&path, cfg.ledger.busy_timeout)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;
    Ok(Arc::new(ledger))
}

fn list_pending(ledger: &dyn LedgerClient) -> Result<()> {
    let pending = ledger.pending_files().context("failed to read pending files")?;
    let mut out = io::stdout().lock();
    for record in &pending {
        serde_json::to_writer(&mut out, record)?;
        writeln!(out)?;
    }
    info!(count = pending.len(), "pending ledger records");
    Ok(())
}

fn log_summary(report: &IngestReport) {
    for failure in &report.walk_failures {
        error!(path = %failure.path.display(), reason = %failure.reason, "subtree not ingested");
    }
    for dir in &report.directories {
        for rejected in &dir.rejected {
            warn!(path = %rejected.source_path.display(), error = %rejected.error, "entry not ingested");
        }
        if let Some(failure) = &dir.failure {
            error!(
                dir = %dir.dir.display(),
                stage = %failure.stage,
                error = %failure.error,
                "directory not ingested"
            );
        }
        for file in &dir.files {
            match &file.outcome {
                FileOutcome::Failed { reason } => {
                    warn!(path = %file.source_path.display(), %reason, "file failed");
                }
                FileOutcome::Unrecorded { reason } => {
                    warn!(path = %file.destination.display(), %reason, "file copied but not recorded");
                }
                FileOutcome::Completed | FileOutcome::Cancelled => {}
            }
        }
    }
    let completed_dirs = report
        .directories
        .iter()
        .filter(|d| d.state == DirectoryState::Completed)
        .count();
    info!(
        directories = completed_dirs,
        uploads = report.uploads().count(),
        files = report.completed_files(),
        clean = report.is_clean(),
        cancelled = report.cancelled,
        "summary"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;

    let cfg = load_config(&args)?;
    let ledger = open_ledger(&args.ledger_endpoint, &args.ledger_database, &cfg)?;

    if args.list_pending {
        return list_pending(ledger.as_ref());
    }

    validate_roots(&args.source, &args.destination)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; no new transfers will start");
            cancel.cancel();
        });
    }

    let pipeline = IngestPipeline::new(&cfg, &args.destination, ledger)?.with_cancellation(cancel);
    let started = Instant::now();
    let report = match pipeline.run(&args.source).await {
        Ok(report) => report,
        Err(err) => bail!("failed to walk {}: {err}", args.source.display()),
    };
    log_summary(&report);
    info!(
        elapsed = %humantime::format_duration(started.elapsed()),
        "organize finished"
    );
    Ok(())
}
