//! Carryover - Command-line interface for the migration engine.
//!
//! A thin front end: it resolves configuration, opens the manifest and calls
//! the engine. Human-readable progress goes to stderr, reports to stdout.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use carryover_engine::{
    error::UnitError,
    fs_ops::ensure_destination_root,
    pipeline::RollbackTarget,
    report::{
        checksum_listing, failed_units, format_bytes, format_duration, render_rollback,
        render_status, render_summary, render_verification, to_json, StatusReport,
        VerificationReport,
    },
    verify, CancellationToken, ExecuteOptions, ManifestStore, MigrationConfig, Migrator,
    PlanOptions, ProgressCallback, RunContext, Summary, TransferUnit, UnitFilter, UnitId,
    UnitState, VerifyOptions,
};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const EXIT_OK: i32 = 0;
const EXIT_UNIT_FAILURES: i32 = 1;
const EXIT_INVOCATION_ERROR: i32 = 2;

/// Carryover - migrate a file collection to new storage, verifiably
#[derive(Parser, Debug)]
#[command(name = "carryover")]
#[command(version)]
#[command(about = "Plan, copy, verify and roll back file migrations")]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Source root (repeatable); replaces `source_paths` from the config
    #[arg(long = "source", value_name = "PATH", global = true)]
    sources: Vec<PathBuf>,

    /// Destination root
    #[arg(long, value_name = "PATH", global = true)]
    dest: Option<PathBuf>,

    /// Manifest file (default: <dest>/.carryover/manifest.jsonl)
    #[arg(long, value_name = "PATH", global = true)]
    manifest: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(long, value_name = "N", global = true)]
    concurrency: Option<usize>,

    /// Units per batch
    #[arg(long, value_name = "N", global = true)]
    batch_size: Option<usize>,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Discover and classify source files, recording a plan in the manifest
    Plan,
    /// Copy every planned unit that has not completed yet
    Execute {
        /// Show what would be copied without copying
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-check copied units against their sources
    Verify {
        /// Write the verification report as JSON
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,
        /// Write a checksum listing of verified files
        #[arg(long, value_name = "PATH")]
        checksums: Option<PathBuf>,
    },
    /// Undo copied units and discard planned ones
    Rollback {
        /// Every unit that can be undone
        #[arg(long, conflicts_with_all = ["batch", "units"])]
        all: bool,
        /// Every unit of one batch
        #[arg(long, value_name = "N", conflicts_with = "units")]
        batch: Option<usize>,
        /// Specific unit ids
        units: Vec<String>,
    },
    /// Show the state of the manifest
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

/// CLI implementation of ProgressCallback for displaying migration progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Instant>,
    total_units: AtomicUsize,
    total_bytes: AtomicU64,
    done_units: AtomicUsize,
    done_bytes: AtomicU64,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_progress_update: Mutex::new(now),
            total_units: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(0),
            done_units: AtomicUsize::new(0),
            done_bytes: AtomicU64::new(0),
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn name(unit: &TransferUnit) -> String {
        unit.record
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "(unknown)".to_string())
    }
}

impl ProgressCallback for CliProgress {
    fn on_run_started(&self, units: usize, bytes: u64) {
        self.total_units.store(units, Ordering::Relaxed);
        self.total_bytes.store(bytes, Ordering::Relaxed);
        eprintln!("Copying {} units ({})", units, format_bytes(bytes));
    }

    fn on_unit_started(&self, unit: &TransferUnit) {
        if self.verbose {
            eprintln!("[attempt {}] Starting: {}", unit.attempts, Self::name(unit));
        }
    }

    fn on_unit_retry(&self, unit: &TransferUnit, error: &UnitError) {
        if self.verbose {
            eprintln!("Retrying {}: {}", Self::name(unit), error);
        }
    }

    fn on_unit_completed(&self, unit: &TransferUnit) {
        let done = self.done_units.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = self.done_bytes.fetch_add(unit.bytes_copied, Ordering::Relaxed) + unit.bytes_copied;

        if self.verbose {
            let status = match unit.state {
                UnitState::Copied => "Copied",
                UnitState::Failed => "Failed",
                _ => "Unknown",
            };
            eprintln!("{}: {}", status, Self::name(unit));
            return;
        }

        // Throttle progress updates to at most one per 200ms
        let Ok(mut last) = self.last_progress_update.lock() else {
            return;
        };
        if last.elapsed() < Duration::from_millis(200) {
            return;
        }
        *last = Instant::now();

        let total = self.total_units.load(Ordering::Relaxed).max(1);
        let percent = (done as f64 / total as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{} units | {}/{}",
            Self::print_progress_bar(percent),
            done,
            total,
            format_bytes(bytes),
            format_bytes(self.total_bytes.load(Ordering::Relaxed))
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_run_completed(&self, _summary: &Summary) {
        if !self.verbose {
            eprintln!();
        }
        eprintln!("Finished in {}", format_duration(self.start_time.elapsed()));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "carryover=debug" } else { "carryover=info" };
    let filter =
        EnvFilter::try_from_env("CARRYOVER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    // A second init (tests) is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Parse arguments, run the command and exit with its code
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let exit_code = match run_cli(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            EXIT_INVOCATION_ERROR
        }
    };

    std::process::exit(exit_code);
}

/// Config file (or defaults) with command-line overrides applied.
fn resolve_config(args: &Args) -> Result<MigrationConfig> {
    let mut config = match &args.config {
        Some(path) => MigrationConfig::load(path)?,
        None => MigrationConfig::default(),
    };

    if !args.sources.is_empty() {
        config.source_paths = args.sources.clone();
    }
    if let Some(dest) = &args.dest {
        config.destination_path = dest.clone();
    }
    if let Some(manifest) = &args.manifest {
        config.manifest_path = Some(manifest.clone());
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    Ok(config)
}

fn open_store(config: &MigrationConfig) -> Result<ManifestStore> {
    let path = config.manifest_path();
    let store = ManifestStore::open(&path, config.hash_algorithm, config.max_attempts())
        .with_context(|| format!("cannot open manifest {}", path.display()))?;
    if !store.load_report().is_clean() {
        eprintln!(
            "Warning: {} corrupt manifest records were skipped",
            store.load_report().corrupt.len()
        );
    }
    Ok(store)
}

/// Open a manifest that an earlier `plan` must have created.
fn open_existing_store(config: &MigrationConfig) -> Result<ManifestStore> {
    if config.destination_path.as_os_str().is_empty() && config.manifest_path.is_none() {
        bail!("either --dest or --manifest is required");
    }
    let path = config.manifest_path();
    if !path.exists() {
        bail!(
            "no manifest at {}; run `carryover plan` first",
            path.display()
        );
    }
    open_store(config)
}

fn write_output(path: &PathBuf, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("cannot write {}", path.display()))?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

/// Main CLI logic - separated for testability. Returns the exit code.
fn run_cli(args: &Args) -> Result<i32> {
    let config = resolve_config(args)?;
    debug!(command = ?args.command, "resolved configuration");

    match &args.command {
        Command::Plan => plan(&config),
        Command::Execute { dry_run } => execute(&config, *dry_run, args.verbose),
        Command::Verify { report, checksums } => {
            verify_copies(&config, report.as_ref(), checksums.as_ref())
        }
        Command::Rollback { all, batch, units } => {
            let target = match (*all, batch, units.as_slice()) {
                (true, _, _) => RollbackTarget::All,
                (false, Some(index), _) => RollbackTarget::Batch(*index),
                (false, None, ids) if !ids.is_empty() => {
                    RollbackTarget::Units(ids.iter().map(UnitId::from_hex).collect())
                }
                _ => bail!("rollback needs --all, --batch N, or unit ids"),
            };
            rollback(&config, &target)
        }
        Command::Status { json } => status(&config, *json),
    }
}

fn plan(config: &MigrationConfig) -> Result<i32> {
    config.validate()?;
    let store = open_store(config)?;
    let skipped_before = store.skipped().len();
    let batches = Migrator::new(&store).plan(
        &config.source_paths,
        &config.discovery_filter(),
        &PlanOptions::from_config(config),
    )?;

    let units: usize = batches.iter().map(|b| b.units.len()).sum();
    println!("Planned {} units in {} batches", units, batches.len());
    let skipped = store.skipped().len();
    if skipped > 0 {
        println!(
            "Skipped during discovery: {} new, {} in manifest",
            skipped.saturating_sub(skipped_before),
            skipped
        );
    }
    Ok(EXIT_OK)
}

fn execute(config: &MigrationConfig, dry_run: bool, verbose: bool) -> Result<i32> {
    let ctx = RunContext::new(CancellationToken::new());
    let options = ExecuteOptions {
        dry_run,
        ..ExecuteOptions::from_config(config)
    };

    // A dry run against a manifest that does not exist yet plans in memory
    let manifest_exists = config.manifest_path().exists();
    let store = if dry_run && !manifest_exists {
        config.validate()?;
        let store = ManifestStore::in_memory(config.hash_algorithm, config.max_attempts());
        Migrator::new(&store).plan(
            &config.source_paths,
            &config.discovery_filter(),
            &PlanOptions::from_config(config),
        )?;
        store
    } else {
        open_existing_store(config)?
    };

    let batches = store.batches();
    if batches.is_empty() {
        bail!("nothing is planned; run `carryover plan` first");
    }

    if !dry_run {
        ensure_destination_root(&config.destination_path)?;
    }

    let progress = CliProgress::new(verbose);
    let summary = Migrator::new(&store)
        .with_progress(&progress)
        .execute(&batches, &options, &ctx)?;

    if dry_run {
        let pending = store.query(&UnitFilter::in_states(&[UnitState::Planned, UnitState::Failed]));
        for unit in &pending {
            println!(
                "{} -> {}",
                unit.record.source_path.display(),
                unit.destination.display()
            );
        }
    }
    print!("{}", render_summary(&summary, &failed_units(&store)));

    let verification = if config.verify_copies && !dry_run && !ctx.is_cancelled() {
        let ids = batches.iter().flat_map(|b| b.units.iter().cloned());
        let verdicts = verify(
            &store,
            &UnitFilter::ids(ids),
            &VerifyOptions {
                tolerance: config.timestamp_tolerance(),
                concurrency: config.concurrency.max(1),
            },
            &ctx,
        )?;
        let report = VerificationReport::build(&store, &verdicts);
        print!("{}", render_verification(&report));
        Some(report)
    } else {
        None
    };
    info!(run_id = %ctx.run_id(), "execute command finished");

    let verify_failed = verification.as_ref().map_or(false, VerificationReport::has_failures);
    Ok(if summary.has_failures() || verify_failed {
        EXIT_UNIT_FAILURES
    } else {
        EXIT_OK
    })
}

fn verify_copies(
    config: &MigrationConfig,
    report_path: Option<&PathBuf>,
    checksums_path: Option<&PathBuf>,
) -> Result<i32> {
    let store = open_existing_store(config)?;
    let ctx = RunContext::new(CancellationToken::new());
    let verdicts = verify(
        &store,
        &UnitFilter::all(),
        &VerifyOptions {
            tolerance: config.timestamp_tolerance(),
            concurrency: config.concurrency.max(1),
        },
        &ctx,
    )?;

    let report = VerificationReport::build(&store, &verdicts);
    print!("{}", render_verification(&report));

    if let Some(path) = report_path {
        write_output(path, &to_json(&report)?)?;
    }
    if let Some(path) = checksums_path {
        let listing = checksum_listing(&store, &UnitFilter::all(), &config.destination_path);
        write_output(path, &listing)?;
    }

    Ok(if report.has_failures() {
        EXIT_UNIT_FAILURES
    } else {
        EXIT_OK
    })
}

fn rollback(config: &MigrationConfig, target: &RollbackTarget) -> Result<i32> {
    let store = open_existing_store(config)?;
    let migrator = Migrator::new(&store);
    let ids = migrator.resolve(target);
    let report = migrator.rollback(&ids, &config.destination_path)?;
    print!("{}", render_rollback(&report));

    Ok(if report.has_failures() {
        EXIT_UNIT_FAILURES
    } else {
        EXIT_OK
    })
}

fn status(config: &MigrationConfig, json: bool) -> Result<i32> {
    let store = open_existing_store(config)?;
    let status = StatusReport::collect(&store);
    if json {
        println!("{}", to_json(&status)?);
    } else {
        print!("{}", render_status(&status));
    }
    Ok(EXIT_OK)
}
