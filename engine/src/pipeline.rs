//! Migration orchestration.
//!
//! This module provides the migration lifecycle:
//! - Planning: discover source files, classify them and persist Planned units
//! - Executing: copy units on a bounded worker pool with retries
//! - Rolling back: delete copied destinations and abandon units
//! - `migrate`: plan, execute and verify in one call
//!
//! Planning and execution are strictly separated. Every unit is persisted as
//! Planned before the first byte is copied, so a dry run is just a plan.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{destination_for, read_sniff, Classifier, ClassifierOptions};
use crate::config::MigrationConfig;
use crate::error::{EngineError, EngineResult, UnitError, UnitErrorKind};
use crate::fs_ops::{
    discover_files, ensure_destination_root, partial_path, remove_destination, Copier,
    CopyRequest, DiscoveryFilter, FsCopier,
};
use crate::manifest::{ManifestStore, TransitionDetail, UnitFilter};
use crate::model::{
    Batch, Category, FileRecord, QualityScore, SkipReason, SkipRecord, Summary, TransferUnit, UnitId,
    UnitState, VerificationVerdict,
};
use crate::progress::{NoProgress, ProgressCallback};
use crate::session::{CancellationToken, RunContext};
use crate::verify::{quality_score, verify, VerifyOptions};
use crate::worker::{backoff_delay, run_pool};

/// How discovered files become units.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub destination_root: PathBuf,
    pub batch_size: usize,
    pub classifier: Classifier,
    /// Byte caps keyed by [`Category::limit_key`]; files over their
    /// category's cap are recorded as oversized skips
    pub size_limits: BTreeMap<String, u64>,
}

impl PlanOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        PlanOptions {
            destination_root: config.destination_path.clone(),
            batch_size: config.batch_size,
            classifier: Classifier::new(ClassifierOptions {
                date_folders: config.create_date_folders,
            }),
            size_limits: config.category_size_limits(),
        }
    }
}

/// How units are copied.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub concurrency: usize,
    /// Report what would run without copying anything
    pub dry_run: bool,
    pub retry_backoff: Duration,
    pub copy_timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        ExecuteOptions {
            concurrency: config.concurrency,
            dry_run: false,
            retry_backoff: config.retry_backoff(),
            copy_timeout: config.copy_timeout(),
        }
    }
}

/// Which units a rollback applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Every unit that can still be undone
    All,
    Batch(usize),
    Units(Vec<UnitId>),
}

/// A unit a rollback could not handle, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackIssue {
    pub unit_id: UnitId,
    pub reason: String,
}

/// Outcome of a rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Copied or Failed units now RolledBack
    pub rolled_back: Vec<UnitId>,
    /// Planned units removed from the manifest
    pub discarded: Vec<UnitId>,
    /// Units in a state rollback does not apply to
    pub rejected: Vec<RollbackIssue>,
    /// Destinations that could not be deleted; those units stay Copied
    pub deletion_failures: Vec<RollbackIssue>,
}

impl RollbackReport {
    pub fn has_failures(&self) -> bool {
        !self.deletion_failures.is_empty()
    }
}

/// Result of [`migrate`].
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub batches: Vec<Batch>,
    pub summary: Summary,
    /// Empty when verification was disabled or the run was cancelled
    pub verdicts: Vec<VerificationVerdict>,
    pub score: Option<QualityScore>,
}

/// Plans, executes and rolls back units held in a manifest store.
pub struct Migrator<'a> {
    store: &'a ManifestStore,
    copier: &'a dyn Copier,
    progress: &'a dyn ProgressCallback,
}

fn is_runnable(unit: &TransferUnit, max_attempts: u32) -> bool {
    match unit.state {
        UnitState::Planned => true,
        UnitState::Failed => unit.attempts < max_attempts,
        _ => false,
    }
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a ManifestStore) -> Self {
        Migrator {
            store,
            copier: &FsCopier,
            progress: &NoProgress,
        }
    }

    pub fn with_copier(mut self, copier: &'a dyn Copier) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &ManifestStore {
        self.store
    }

    /// Discover, classify and persist units for every source root.
    ///
    /// Files that already have a unit keep it. New units are grouped into
    /// batches of `batch_size`, numbered after any batches already planned.
    ///
    /// # Arguments
    /// * `roots` - Source roots to walk
    /// * `filter` - Extension, directory and global size filters for the walk
    /// * `options` - Destination root, batch size, classifier and category caps
    ///
    /// # Returns
    /// Every batch touched by this plan, in batch order
    ///
    /// # Errors
    /// Fails on an unreachable source root or a manifest write error. Files
    /// that cannot be read or are too large are recorded as skips instead.
    pub fn plan(
        &self,
        roots: &[PathBuf],
        filter: &DiscoveryFilter,
        options: &PlanOptions,
    ) -> EngineResult<Vec<Batch>> {
        if options.batch_size == 0 {
            return Err(EngineError::invalid_config("batch_size", "must be positive"));
        }

        let mut ids = Vec::new();
        let mut fresh = Vec::new();
        let mut skipped = 0usize;

        for root in roots {
            let discovery = discover_files(root, filter)?;
            for skip in discovery.skipped {
                skipped += 1;
                self.store.record_skip(skip)?;
            }

            for file in discovery.files {
                if let Some(existing) = self.store.unit_for_source(&file.path) {
                    ids.push(existing.id);
                    continue;
                }

                let sniff = match read_sniff(&file.path) {
                    Ok(sniff) => sniff,
                    Err(err) => {
                        warn!(path = %file.path.display(), error = %err, "skipping unreadable file");
                        skipped += 1;
                        self.store.record_skip(SkipRecord {
                            path: file.path,
                            category: Category::Unknown,
                            reason: SkipReason::Unreadable {
                                message: err.to_string(),
                            },
                        })?;
                        continue;
                    }
                };
                let (category, placement) = options.classifier.classify(&file.path, &sniff);
                if let Some(&limit) = options.size_limits.get(category.limit_key()) {
                    if file.size > limit {
                        debug!(path = %file.path.display(), size = file.size, limit, %category, "over category limit");
                        skipped += 1;
                        self.store.record_skip(SkipRecord {
                            path: file.path,
                            category,
                            reason: SkipReason::Oversized {
                                size: file.size,
                                limit,
                            },
                        })?;
                        continue;
                    }
                }
                fresh.push((
                    FileRecord {
                        source_path: file.path,
                        source_root: file.root,
                        size: file.size,
                        modified: file.modified,
                        category,
                        hash: None,
                    },
                    placement,
                ));
            }
        }

        let first_batch = self.store.next_batch_index();
        let planned = fresh.len();
        for (n, (record, placement)) in fresh.into_iter().enumerate() {
            let desired = destination_for(&record, placement, &options.destination_root);
            let batch = first_batch + n / options.batch_size;
            match self.store.plan_unit(record, placement, batch, &desired) {
                Ok(unit) => ids.push(unit.id),
                Err(err @ EngineError::DuplicateUnit { .. }) => {
                    warn!(error = %err, "file not planned");
                }
                Err(err) => return Err(err),
            }
        }

        let mut grouped: BTreeMap<usize, Vec<UnitId>> = BTreeMap::new();
        for id in ids {
            if let Some(unit) = self.store.unit(&id) {
                grouped.entry(unit.batch).or_default().push(id);
            }
        }
        let batches: Vec<Batch> = grouped
            .into_iter()
            .map(|(index, units)| Batch { index, units })
            .collect();

        info!(
            roots = roots.len(),
            planned,
            batches = batches.len(),
            skipped,
            "plan complete"
        );
        Ok(batches)
    }

    /// Move units a crashed run left in Copying to Failed, so they can retry.
    pub fn recover_interrupted(&self) -> EngineResult<usize> {
        let stuck = self
            .store
            .query(&UnitFilter::in_states(&[UnitState::Copying]));
        for unit in &stuck {
            warn!(unit = %unit.id, "unit was left mid-copy by an earlier run");
            if let Err(err) = fs::remove_file(partial_path(&unit.destination)) {
                debug!(unit = %unit.id, error = %err, "no partial copy to remove");
            }
            self.store.transition(
                &unit.id,
                UnitState::Failed,
                TransitionDetail::failed(UnitError {
                    kind: UnitErrorKind::Interrupted,
                    message: "copy did not finish before the previous run ended".to_string(),
                    os_code: None,
                }),
            )?;
        }
        Ok(stuck.len())
    }

    /// Copy every runnable unit of `batches`.
    ///
    /// Planned units and Failed units with attempts left are copied; anything
    /// else is left alone, so running twice never copies a unit twice.
    /// Batches run in order; cancellation stops new units from starting.
    ///
    /// # Errors
    /// Only run-level failures: zero concurrency or a manifest write error.
    /// A unit that cannot be copied ends Failed and is listed in the summary.
    pub fn execute(
        &self,
        batches: &[Batch],
        options: &ExecuteOptions,
        ctx: &RunContext,
    ) -> EngineResult<Summary> {
        if options.concurrency == 0 {
            return Err(EngineError::invalid_config("concurrency", "must be positive"));
        }
        if !options.dry_run {
            self.recover_interrupted()?;
        }

        let max_attempts = self.store.max_attempts();
        let queued: Vec<Vec<TransferUnit>> = batches
            .iter()
            .map(|batch| {
                batch
                    .units
                    .iter()
                    .filter_map(|id| self.store.unit(id))
                    .filter(|unit| is_runnable(unit, max_attempts))
                    .collect()
            })
            .collect();
        let unit_count: usize = queued.iter().map(Vec::len).sum();
        let byte_count: u64 = queued.iter().flatten().map(|u| u.record.size).sum();

        info!(
            run_id = %ctx.run_id(),
            units = unit_count,
            bytes = byte_count,
            batches = batches.len(),
            dry_run = options.dry_run,
            "execute started"
        );

        if !options.dry_run {
            self.progress.on_run_started(unit_count, byte_count);
            for (batch, units) in batches.iter().zip(queued) {
                if ctx.is_cancelled() {
                    break;
                }
                if units.is_empty() {
                    continue;
                }
                debug!(run_id = %ctx.run_id(), batch = batch.index, units = units.len(), "batch started");
                run_pool(units, options.concurrency, ctx.cancellation(), |unit| {
                    self.run_unit(unit, options, ctx)
                })
                .into_iter()
                .collect::<EngineResult<Vec<()>>>()?;
            }
        }

        let summary = self.summarize(batches, options.dry_run, ctx);
        if !options.dry_run {
            self.progress.on_run_completed(&summary);
        }
        info!(
            run_id = %ctx.run_id(),
            copied = summary.count(UnitState::Copied),
            failed = summary.count(UnitState::Failed),
            bytes = summary.bytes_moved,
            retries = summary.retries,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "execute finished"
        );
        Ok(summary)
    }

    /// Copy one unit, retrying with backoff until it succeeds or runs out of attempts.
    fn run_unit(
        &self,
        unit: TransferUnit,
        options: &ExecuteOptions,
        ctx: &RunContext,
    ) -> EngineResult<()> {
        let max_attempts = self.store.max_attempts();
        let mut unit = unit;

        loop {
            unit = match self
                .store
                .transition(&unit.id, UnitState::Copying, TransitionDetail::none())
            {
                Ok(unit) => unit,
                Err(EngineError::RetryLimitExceeded { .. }) => return Ok(()),
                Err(err) => return Err(err),
            };
            ctx.record_attempt(unit.attempts);
            self.progress.on_unit_started(&unit);

            let request = CopyRequest {
                source: &unit.record.source_path,
                destination: &unit.destination,
                algorithm: self.store.algorithm(),
                deadline: options.copy_timeout.map(|timeout| Instant::now() + timeout),
            };

            match self.copier.copy(&request) {
                Ok(outcome) => {
                    let bytes = outcome.bytes;
                    unit = self.store.transition(
                        &unit.id,
                        UnitState::Copied,
                        TransitionDetail::copied(outcome.hash, outcome.bytes, outcome.source_modified),
                    )?;
                    ctx.add_bytes(bytes);
                    self.progress.on_unit_completed(&unit);
                    return Ok(());
                }
                Err(err) => {
                    let error = err.to_unit_error();
                    unit = self.store.transition(
                        &unit.id,
                        UnitState::Failed,
                        TransitionDetail::failed(error.clone()),
                    )?;

                    if unit.attempts >= max_attempts || ctx.is_cancelled() {
                        warn!(
                            run_id = %ctx.run_id(),
                            unit = %unit.id,
                            attempts = unit.attempts,
                            error = %error,
                            "giving up on unit"
                        );
                        self.progress.on_unit_completed(&unit);
                        return Ok(());
                    }

                    let delay = backoff_delay(options.retry_backoff, unit.attempts);
                    warn!(
                        run_id = %ctx.run_id(),
                        unit = %unit.id,
                        attempt = unit.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "copy failed, retrying"
                    );
                    self.progress.on_unit_retry(&unit, &error);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    fn summarize(&self, batches: &[Batch], dry_run: bool, ctx: &RunContext) -> Summary {
        let mut by_state = BTreeMap::new();
        let mut failed_units = Vec::new();
        for id in batches.iter().flat_map(|batch| &batch.units) {
            if let Some(unit) = self.store.unit(id) {
                *by_state.entry(unit.state).or_insert(0) += 1;
                if unit.state == UnitState::Failed {
                    failed_units.push(unit.id);
                }
            }
        }

        Summary {
            run_id: ctx.run_id(),
            started_at: ctx.started_at(),
            dry_run,
            cancelled: ctx.is_cancelled(),
            by_state,
            skipped_in_manifest: self.store.skipped().len(),
            bytes_moved: ctx.bytes_moved(),
            retries: ctx.retries(),
            elapsed: ctx.elapsed(),
            failed_units,
        }
    }

    /// Ids a rollback target resolves to.
    pub fn resolve(&self, target: &RollbackTarget) -> Vec<UnitId> {
        let filter = match target {
            RollbackTarget::All => UnitFilter::in_states(&[
                UnitState::Planned,
                UnitState::Copied,
                UnitState::Failed,
            ]),
            RollbackTarget::Batch(index) => UnitFilter::batch(*index),
            RollbackTarget::Units(ids) => return ids.clone(),
        };
        self.store
            .query(&filter)
            .into_iter()
            .map(|unit| unit.id)
            .collect()
    }

    /// Undo units, best effort.
    ///
    /// Copied units lose their destination file (and any directories left
    /// empty below `destination_root`) and become RolledBack. Failed units are
    /// abandoned. Planned units are discarded. A file that cannot be deleted is
    /// reported and its unit stays Copied; the rest of the rollback continues.
    ///
    /// # Arguments
    /// * `ids` - Units to undo, usually from [`Migrator::resolve`]
    /// * `destination_root` - Upper bound for pruning emptied directories
    ///
    /// # Errors
    /// Returns EngineError only if the manifest cannot be written
    pub fn rollback(&self, ids: &[UnitId], destination_root: &Path) -> EngineResult<RollbackReport> {
        let mut report = RollbackReport::default();

        for id in ids {
            let unit = match self.store.unit(id) {
                Some(unit) => unit,
                None => {
                    report.rejected.push(RollbackIssue {
                        unit_id: id.clone(),
                        reason: "unknown unit".to_string(),
                    });
                    continue;
                }
            };

            match unit.state {
                UnitState::Planned => {
                    self.store.discard(id)?;
                    report.discarded.push(id.clone());
                }
                UnitState::Copied => match remove_destination(&unit.destination, destination_root) {
                    Ok(_) => {
                        self.store
                            .transition(id, UnitState::RolledBack, TransitionDetail::none())?;
                        report.rolled_back.push(id.clone());
                    }
                    Err(err) => {
                        warn!(unit = %id, path = %unit.destination.display(), error = %err, "could not delete destination");
                        report.deletion_failures.push(RollbackIssue {
                            unit_id: id.clone(),
                            reason: format!("{}: {}", unit.destination.display(), err),
                        });
                    }
                },
                UnitState::Failed => {
                    self.store
                        .transition(id, UnitState::RolledBack, TransitionDetail::none())?;
                    report.rolled_back.push(id.clone());
                }
                state @ (UnitState::Copying | UnitState::Verified | UnitState::RolledBack) => {
                    report.rejected.push(RollbackIssue {
                        unit_id: id.clone(),
                        reason: format!("unit is {}", state),
                    });
                }
            }
        }

        info!(
            rolled_back = report.rolled_back.len(),
            discarded = report.discarded.len(),
            rejected = report.rejected.len(),
            deletion_failures = report.deletion_failures.len(),
            "rollback finished"
        );
        Ok(report)
    }
}

/// Plan, execute and (when `verify_copies` is set) verify in one call.
pub fn migrate(
    config: &MigrationConfig,
    store: &ManifestStore,
    progress: &dyn ProgressCallback,
    cancel: CancellationToken,
) -> EngineResult<MigrationOutcome> {
    config.validate()?;
    ensure_destination_root(&config.destination_path)?;

    let ctx = RunContext::new(cancel);
    let migrator = Migrator::new(store).with_progress(progress);
    let batches = migrator.plan(
        &config.source_paths,
        &config.discovery_filter(),
        &PlanOptions::from_config(config),
    )?;
    let summary = migrator.execute(&batches, &ExecuteOptions::from_config(config), &ctx)?;

    let (verdicts, score) = if config.verify_copies && !ctx.is_cancelled() {
        let ids = batches.iter().flat_map(|b| b.units.iter().cloned());
        let verdicts = verify(
            store,
            &UnitFilter::ids(ids),
            &VerifyOptions {
                tolerance: config.timestamp_tolerance(),
                concurrency: config.concurrency,
            },
            &ctx,
        )?;
        let score = quality_score(&verdicts);
        (verdicts, Some(score))
    } else {
        (Vec::new(), None)
    };

    Ok(MigrationOutcome {
        batches,
        summary,
        verdicts,
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::error::CopyError;
    use crate::fs_ops::CopyOutcome;
    use crate::model::{Severity, VerdictClass};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fixture {
        _temp: tempfile::TempDir,
        src: PathBuf,
        dst: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("Failed to create temp dir");
            let src = temp.path().join("photos");
            let dst = temp.path().join("archive");
            fs::create_dir_all(&src).expect("Failed to create src dir");
            fs::create_dir_all(&dst).expect("Failed to create dst dir");
            Fixture {
                _temp: temp,
                src,
                dst,
            }
        }

        fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
            let path = self.src.join(relative);
            fs::create_dir_all(path.parent().expect("has parent")).expect("Failed to create dir");
            fs::write(&path, content).expect("Failed to write file");
            path
        }

        fn plan_options(&self, batch_size: usize) -> PlanOptions {
            PlanOptions {
                destination_root: self.dst.clone(),
                batch_size,
                classifier: Classifier::default(),
                size_limits: BTreeMap::new(),
            }
        }
    }

    fn filter() -> DiscoveryFilter {
        DiscoveryFilter {
            max_file_size: 1024 * 1024,
            ..DiscoveryFilter::default()
        }
    }

    fn options(concurrency: usize) -> ExecuteOptions {
        ExecuteOptions {
            concurrency,
            dry_run: false,
            retry_backoff: Duration::ZERO,
            copy_timeout: None,
        }
    }

    fn count_state(store: &ManifestStore, state: UnitState) -> usize {
        store.query(&UnitFilter::in_states(&[state])).len()
    }

    /// Counts calls, then delegates to the filesystem.
    #[derive(Default)]
    struct CountingCopier {
        calls: AtomicUsize,
    }

    impl Copier for CountingCopier {
        fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FsCopier.copy(request)
        }
    }

    /// Fails a seeded ~10% of attempts, at most `max_per_file` times per file.
    struct FlakyCopier {
        rng: Mutex<StdRng>,
        failures: Mutex<HashMap<PathBuf, u32>>,
        max_per_file: u32,
        injected: AtomicUsize,
    }

    impl FlakyCopier {
        fn new(seed: u64, max_per_file: u32) -> Self {
            FlakyCopier {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
                failures: Mutex::new(HashMap::new()),
                max_per_file,
                injected: AtomicUsize::new(0),
            }
        }
    }

    impl Copier for FlakyCopier {
        fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError> {
            let roll = self.rng.lock().expect("rng lock").gen_bool(0.1);
            if roll {
                let mut failures = self.failures.lock().expect("failures lock");
                let count = failures.entry(request.source.to_path_buf()).or_insert(0);
                if *count < self.max_per_file {
                    *count += 1;
                    self.injected.fetch_add(1, Ordering::SeqCst);
                    return Err(CopyError::destination(
                        request.destination,
                        io::Error::new(io::ErrorKind::Other, "injected transient failure"),
                    ));
                }
            }
            FsCopier.copy(request)
        }
    }

    /// Every attempt runs past its deadline.
    #[derive(Default)]
    struct TimeoutCopier {
        calls: AtomicUsize,
    }

    impl Copier for TimeoutCopier {
        fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CopyError::timeout(request.destination))
        }
    }

    struct RecordingProgress {
        calls: Mutex<Vec<String>>,
    }

    impl ProgressCallback for RecordingProgress {
        fn on_run_started(&self, units: usize, _bytes: u64) {
            self.calls.lock().expect("lock").push(format!("run_started({})", units));
        }

        fn on_unit_started(&self, _unit: &TransferUnit) {
            self.calls.lock().expect("lock").push("unit_started".to_string());
        }

        fn on_unit_completed(&self, unit: &TransferUnit) {
            self.calls
                .lock()
                .expect("lock")
                .push(format!("unit_completed({})", unit.state));
        }

        fn on_run_completed(&self, _summary: &Summary) {
            self.calls.lock().expect("lock").push("run_completed".to_string());
        }
    }

    #[test]
    fn test_plan_batches_and_records_skips() {
        let fx = Fixture::new();
        for i in 0..5 {
            fx.write(&format!("doc{}.txt", i), b"hello");
        }
        fx.write("huge.bin", &vec![0u8; 2 * 1024 * 1024]);

        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let batches = Migrator::new(&store)
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(2))
            .expect("plan");

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(|b| b.units.len()).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(count_state(&store, UnitState::Planned), 5);
        let skipped = store.skipped();
        assert_eq!(skipped.len(), 1);
        assert!(matches!(skipped[0].reason, SkipReason::Oversized { .. }));
        assert_eq!(skipped[0].category, Category::Unknown);

        let unit = store.query(&UnitFilter::all()).remove(0);
        assert_eq!(unit.destination, fx.dst.join("Documents").join("photos").join("doc0.txt"));
    }

    #[test]
    fn test_replan_is_idempotent() {
        let fx = Fixture::new();
        fx.write("a.txt", b"a");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let first = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        fx.write("b.txt", b"b");
        let second = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("replan");

        assert_eq!(store.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[0]);
        assert_eq!(second[1].index, 1);
    }

    #[test]
    fn test_execute_copies_then_second_run_is_noop() {
        let fx = Fixture::new();
        fx.write("a.txt", b"hello");
        fx.write("nested/b.txt", b"world!");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let copier = CountingCopier::default();
        let migrator = Migrator::new(&store).with_copier(&copier);

        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        let summary = migrator
            .execute(&batches, &options(2), &RunContext::default())
            .expect("execute");

        assert_eq!(summary.count(UnitState::Copied), 2);
        assert_eq!(summary.bytes_moved, 11);
        assert!(!summary.has_failures());
        assert_eq!(
            fs::read(fx.dst.join("Documents").join("photos").join("nested").join("b.txt"))
                .expect("copied file"),
            b"world!"
        );

        let verdicts = verify(
            &store,
            &UnitFilter::all(),
            &VerifyOptions::default(),
            &RunContext::default(),
        )
        .expect("verify");
        assert!(verdicts.iter().all(|v| v.classification == VerdictClass::Pass));
        for unit in store.query(&UnitFilter::all()) {
            assert_eq!(unit.state, UnitState::Verified);
            let recomputed =
                crate::checksums::compute_file_checksum(&unit.destination, store.algorithm())
                    .expect("hash");
            assert_eq!(unit.record.hash, Some(recomputed));
        }

        let before = copier.calls.load(Ordering::SeqCst);
        let ctx = RunContext::default();
        let again = migrator.execute(&batches, &options(2), &ctx).expect("execute again");
        assert_eq!(copier.calls.load(Ordering::SeqCst), before);
        assert_eq!(ctx.copy_attempts(), 0);
        assert_eq!(again.count(UnitState::Verified), 2);
    }

    #[test]
    fn test_source_deleted_after_plan_ends_failed() {
        let fx = Fixture::new();
        let doomed = fx.write("doomed.txt", b"bye");
        fx.write("kept.txt", b"stay");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 2);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        fs::remove_file(&doomed).expect("delete source");

        let summary = migrator
            .execute(&batches, &options(2), &RunContext::default())
            .expect("execute");

        assert_eq!(summary.count(UnitState::Failed), 1);
        assert_eq!(summary.count(UnitState::Copied), 1);
        assert_eq!(summary.total_units(), 2);
        let failed = store.unit(&summary.failed_units[0]).expect("failed unit");
        assert_eq!(failed.attempts, 2);
        assert_eq!(
            failed.last_error.map(|e| e.kind),
            Some(UnitErrorKind::SourceUnreadable)
        );
        assert_eq!(summary.retries, 1);
    }

    #[test]
    fn test_rollback_removes_copied_files() {
        let fx = Fixture::new();
        for i in 0..6 {
            fx.write(&format!("deep/dir/f{}.txt", i), b"data");
        }
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(100))
            .expect("plan");
        migrator
            .execute(&batches, &options(3), &RunContext::default())
            .expect("execute");
        let copied = store.query(&UnitFilter::in_states(&[UnitState::Copied]));
        assert_eq!(copied.len(), 6);

        let ids = migrator.resolve(&RollbackTarget::Batch(0));
        let report = migrator.rollback(&ids, &fx.dst).expect("rollback");

        assert_eq!(report.rolled_back.len(), 6);
        assert!(!report.has_failures());
        assert_eq!(count_state(&store, UnitState::RolledBack), 6);
        for unit in copied {
            assert!(!unit.destination.exists());
        }
        assert!(!fx.dst.join("Documents").exists());
        assert!(fx.dst.exists());
    }

    #[test]
    fn test_rollback_discards_planned_and_rejects_verified() {
        let fx = Fixture::new();
        fx.write("a.txt", b"a");
        fx.write("b.txt", b"b");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(1))
            .expect("plan");
        migrator
            .execute(&batches[..1], &options(1), &RunContext::default())
            .expect("execute first batch");
        verify(&store, &UnitFilter::all(), &VerifyOptions::default(), &RunContext::default())
            .expect("verify");

        let mut ids = migrator.resolve(&RollbackTarget::Units(vec![
            batches[0].units[0].clone(),
            batches[1].units[0].clone(),
        ]));
        ids.push(UnitId::from_hex("ffff"));
        let report = migrator.rollback(&ids, &fx.dst).expect("rollback");

        assert_eq!(report.discarded, vec![batches[1].units[0].clone()]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].reason, "unit is verified");
        assert_eq!(report.rejected[1].reason, "unknown unit");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_five_hundred_units_survive_transient_failures() {
        let fx = Fixture::new();
        let mut expected_bytes = 0u64;
        for i in 0..500usize {
            let content = vec![(i % 251) as u8; i % 97 + 1];
            expected_bytes += content.len() as u64;
            fx.write(&format!("d{}/f{}.dat", i % 10, i), &content);
        }
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Crc32, 4);
        let copier = FlakyCopier::new(0x5eed, 2);
        let migrator = Migrator::new(&store).with_copier(&copier);

        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(100))
            .expect("plan");
        assert_eq!(batches.len(), 5);
        let summary = migrator
            .execute(&batches, &options(8), &RunContext::default())
            .expect("execute");

        assert!(copier.injected.load(Ordering::SeqCst) > 0);
        assert_eq!(summary.count(UnitState::Failed), 0);
        assert_eq!(summary.count(UnitState::Copied), 500);
        assert_eq!(summary.bytes_moved, expected_bytes);
        assert_eq!(summary.retries, copier.injected.load(Ordering::SeqCst) as u64);
    }

    #[test]
    fn test_cancelled_run_leaves_units_planned() {
        let fx = Fixture::new();
        fx.write("a.txt", b"a");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = migrator
            .execute(&batches, &options(2), &RunContext::new(cancel))
            .expect("execute");
        assert!(summary.cancelled);
        assert_eq!(summary.count(UnitState::Planned), 1);
    }

    #[test]
    fn test_dry_run_copies_nothing() {
        let fx = Fixture::new();
        fx.write("a.txt", b"a");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        let summary = migrator
            .execute(
                &batches,
                &ExecuteOptions {
                    dry_run: true,
                    ..options(2)
                },
                &RunContext::default(),
            )
            .expect("dry run");
        assert!(summary.dry_run);
        assert_eq!(summary.count(UnitState::Planned), 1);
        assert!(!fx.dst.join("Documents").exists());
    }

    #[test]
    fn test_interrupted_unit_is_retried() {
        let fx = Fixture::new();
        fx.write("a.txt", b"abc");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        let id = batches[0].units[0].clone();
        store
            .transition(&id, UnitState::Copying, TransitionDetail::none())
            .expect("simulate crash mid-copy");

        migrator
            .execute(&batches, &options(1), &RunContext::default())
            .expect("execute");
        let unit = store.unit(&id).expect("unit");
        assert_eq!(unit.state, UnitState::Copied);
        assert_eq!(unit.attempts, 2);
    }

    #[test]
    fn test_progress_events() {
        let fx = Fixture::new();
        fx.write("a.txt", b"a");
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let progress = RecordingProgress {
            calls: Mutex::new(Vec::new()),
        };
        let migrator = Migrator::new(&store).with_progress(&progress);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        migrator
            .execute(&batches, &options(1), &RunContext::default())
            .expect("execute");

        assert_eq!(
            *progress.calls.lock().expect("lock"),
            vec![
                "run_started(1)".to_string(),
                "unit_started".to_string(),
                "unit_completed(copied)".to_string(),
                "run_completed".to_string(),
            ]
        );
    }

    #[test]
    fn test_migrate_end_to_end_with_manifest_file() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.write("b.wpd", b"\xFFWPCbeta");
        let config = MigrationConfig {
            source_paths: vec![fx.src.clone()],
            destination_path: fx.dst.clone(),
            concurrency: 2,
            retry_backoff_ms: 0,
            ..MigrationConfig::default()
        };
        let store =
            ManifestStore::open(config.manifest_path(), config.hash_algorithm, config.max_attempts())
                .expect("open manifest");

        let outcome = migrate(&config, &store, &NoProgress, CancellationToken::new())
            .expect("migrate");
        assert_eq!(outcome.summary.count(UnitState::Copied), 2);
        assert_eq!(outcome.verdicts.len(), 2);
        assert_eq!(outcome.score.map(|s| s.severity), Some(Severity::Excellent));
        assert!(fx
            .dst
            .join("Legacy")
            .join("WordPerfect")
            .join("photos")
            .join("b.wpd")
            .exists());

        drop(store);
        let reopened =
            ManifestStore::open(config.manifest_path(), config.hash_algorithm, config.max_attempts())
                .expect("reopen");
        assert_eq!(count_state(&reopened, UnitState::Verified), 2);
    }

    #[test]
    fn test_timeouts_use_up_the_retry_budget() {
        let fx = Fixture::new();
        fx.write("slow.txt", b"slow");

        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 3);
        let copier = TimeoutCopier::default();
        let migrator = Migrator::new(&store).with_copier(&copier);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        let mut opts = options(1);
        opts.copy_timeout = Some(Duration::from_millis(1));
        let summary = migrator
            .execute(&batches, &opts, &RunContext::default())
            .expect("execute");

        assert_eq!(copier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(summary.count(UnitState::Failed), 1);
        let unit = store.query(&UnitFilter::all()).remove(0);
        assert_eq!(unit.state, UnitState::Failed);
        assert_eq!(unit.attempts, store.max_attempts());
        let last = unit.last_error.expect("timeout recorded");
        assert_eq!(last.kind, UnitErrorKind::Timeout);

        // a second run has nothing left to try
        migrator
            .execute(&batches, &opts, &RunContext::default())
            .expect("second execute");
        assert_eq!(copier.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_category_limit_records_oversized_skip() {
        let fx = Fixture::new();
        fx.write("small.txt", b"short");
        fx.write("long.txt", &vec![b'x'; 4096]);

        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        let mut plan_options = fx.plan_options(10);
        plan_options.size_limits.insert("document".to_string(), 1024);
        let batches = Migrator::new(&store)
            .plan(&[fx.src.clone()], &filter(), &plan_options)
            .expect("plan");

        assert_eq!(batches.iter().map(|b| b.units.len()).sum::<usize>(), 1);
        let skipped = store.skipped();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].path, fx.src.join("long.txt"));
        assert_eq!(skipped[0].category, Category::Document);
        assert_eq!(
            skipped[0].reason,
            SkipReason::Oversized {
                size: 4096,
                limit: 1024
            }
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_names_plan_execute_and_reopen() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        fx.write("good.txt", b"plain");
        let odd = fx.src.join(OsStr::from_bytes(b"caf\xe9.txt"));
        fs::write(&odd, b"latin-1 name").expect("Failed to write non-UTF-8 file");

        let manifest = fx.dst.join("manifest.jsonl");
        let store = ManifestStore::open(&manifest, ChecksumAlgorithm::Blake3, 4)
            .expect("Failed to open manifest");
        let migrator = Migrator::new(&store);
        let batches = migrator
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");
        let summary = migrator
            .execute(&batches, &options(2), &RunContext::default())
            .expect("execute");
        assert_eq!(summary.count(UnitState::Copied), 2);

        drop(store);
        let reopened = ManifestStore::open(&manifest, ChecksumAlgorithm::Blake3, 4)
            .expect("Failed to reopen manifest");
        assert!(reopened.load_report().corrupt.is_empty());
        let unit = reopened.unit_for_source(&odd).expect("non-UTF-8 unit survives reopen");
        assert_eq!(unit.state, UnitState::Copied);
        assert_eq!(
            unit.destination,
            fx.dst
                .join("Documents")
                .join("photos")
                .join(OsStr::from_bytes(b"caf\xe9.txt"))
        );
        assert_eq!(
            fs::read(&unit.destination).expect("Failed to read copy"),
            b"latin-1 name"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_names_differing_in_invalid_bytes_get_separate_units() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        let first = fx.src.join(OsStr::from_bytes(b"a\xff.txt"));
        let second = fx.src.join(OsStr::from_bytes(b"a\xfe.txt"));
        fs::write(&first, b"one").expect("Failed to write first file");
        fs::write(&second, b"two").expect("Failed to write second file");

        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 4);
        Migrator::new(&store)
            .plan(&[fx.src.clone()], &filter(), &fx.plan_options(10))
            .expect("plan");

        let units = store.query(&UnitFilter::all());
        assert_eq!(units.len(), 2);
        assert_ne!(units[0].id, units[1].id);
        assert_ne!(units[0].destination, units[1].destination);
        assert!(store.unit_for_source(&first).is_some());
        assert!(store.unit_for_source(&second).is_some());
    }
}
