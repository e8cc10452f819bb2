//! Durable manifest of transfer units and verdicts.
//!
//! The manifest is a JSON Lines log. Every plan, state transition, verdict and
//! discovery skip is appended as one complete line and fsynced before the
//! in-memory index is updated, so a record is never visible until it is whole.
//! Reopening the file replays the log to rebuild state.
//!
//! On reload:
//! - a final line with no trailing newline is a torn write; it is ignored and
//!   cut off before anything else is appended
//! - a line that fails to parse, or does not apply to the rebuilt state, is
//!   reported in [`LoadReport`] and skipped; replay continues
//!
//! An append that fails partway is cut back to the last complete record
//! before the error is returned. If even that fails the store refuses further
//! appends, since anything written after a partial line would be lost on
//! reload.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};
use crate::classify::disambiguate;
use crate::error::{EngineError, EngineResult, UnitError};
use crate::model::{
    Batch, FileRecord, PlacementRule, SkipRecord, TransferUnit, UnitId, UnitState,
    VerificationVerdict,
};

const FORMAT_VERSION: u32 = 1;

/// One line of the manifest log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    seq: u64,
    at: DateTime<Utc>,
    unit_id: Option<UnitId>,
    event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum Event {
    Header {
        version: u32,
        algorithm: ChecksumAlgorithm,
    },
    Plan {
        unit: TransferUnit,
    },
    Transition {
        from: UnitState,
        to: UnitState,
        attempt: u32,
        error: Option<UnitError>,
        hash: Option<ChecksumValue>,
        bytes: Option<u64>,
        source_modified: Option<DateTime<Utc>>,
    },
    Hash {
        hash: ChecksumValue,
    },
    Verdict {
        verdict: VerificationVerdict,
    },
    Skipped {
        skip: SkipRecord,
    },
    Discard,
}

/// Extra data carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub error: Option<UnitError>,
    /// Content hash measured during the copy
    pub hash: Option<ChecksumValue>,
    /// Bytes written by the copy
    pub bytes: Option<u64>,
    /// Source mtime observed when the copy started
    pub source_modified: Option<DateTime<Utc>>,
}

impl TransitionDetail {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn failed(error: UnitError) -> Self {
        TransitionDetail {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn copied(hash: ChecksumValue, bytes: u64, source_modified: DateTime<Utc>) -> Self {
        TransitionDetail {
            hash: Some(hash),
            bytes: Some(bytes),
            source_modified: Some(source_modified),
            ..Self::default()
        }
    }
}

/// Selects units from the store. Empty criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct UnitFilter {
    pub states: Option<Vec<UnitState>>,
    pub ids: Option<HashSet<UnitId>>,
    pub batch: Option<usize>,
}

impl UnitFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_states(states: &[UnitState]) -> Self {
        UnitFilter {
            states: Some(states.to_vec()),
            ..Self::default()
        }
    }

    pub fn ids(ids: impl IntoIterator<Item = UnitId>) -> Self {
        UnitFilter {
            ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn batch(index: usize) -> Self {
        UnitFilter {
            batch: Some(index),
            ..Self::default()
        }
    }

    pub fn matches(&self, unit: &TransferUnit) -> bool {
        self.states
            .as_ref()
            .map_or(true, |states| states.contains(&unit.state))
            && self.ids.as_ref().map_or(true, |ids| ids.contains(&unit.id))
            && self.batch.map_or(true, |batch| unit.batch == batch)
    }
}

/// A manifest line that could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// 1-based line number
    pub line: usize,
    pub reason: String,
}

/// What happened while reloading a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    pub corrupt: Vec<CorruptRecord>,
    /// Bytes of an incomplete final line that were cut off
    pub torn_bytes: usize,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.torn_bytes == 0
    }
}

#[derive(Default)]
struct Index {
    units: HashMap<UnitId, TransferUnit>,
    /// Plan order; discarded units leave a `None` behind
    order: Vec<Option<UnitId>>,
    positions: HashMap<UnitId, usize>,
    by_source: HashMap<PathBuf, UnitId>,
    claimed: HashSet<PathBuf>,
    verdicts: Vec<VerificationVerdict>,
    skipped: BTreeMap<PathBuf, SkipRecord>,
}

impl Index {
    fn apply(&mut self, record: &Record) -> Result<(), String> {
        let unit_id = record.unit_id.as_ref();
        match &record.event {
            Event::Header { .. } => Ok(()),
            Event::Plan { unit } => {
                if self.units.contains_key(&unit.id) {
                    return Err(format!("unit {} planned twice", unit.id));
                }
                if self.claimed.contains(&unit.destination) {
                    return Err(format!(
                        "destination {} claimed twice",
                        unit.destination.display()
                    ));
                }
                self.positions.insert(unit.id.clone(), self.order.len());
                self.order.push(Some(unit.id.clone()));
                self.by_source
                    .insert(unit.record.source_path.clone(), unit.id.clone());
                self.claimed.insert(unit.destination.clone());
                self.units.insert(unit.id.clone(), unit.clone());
                Ok(())
            }
            Event::Transition {
                from,
                to,
                attempt,
                error,
                hash,
                bytes,
                source_modified,
            } => {
                let unit = self.unit_mut(unit_id)?;
                if unit.state != *from || !from.can_transition_to(*to) {
                    return Err(format!(
                        "transition {} -> {} does not apply to unit {} in state {}",
                        from, to, unit.id, unit.state
                    ));
                }
                unit.state = *to;
                unit.attempts = *attempt;
                unit.updated_at = record.at;
                if *to == UnitState::Failed {
                    unit.last_error = error.clone();
                }
                if *to == UnitState::Copied {
                    unit.last_error = None;
                    if let Some(bytes) = bytes {
                        unit.bytes_copied = *bytes;
                    }
                    if unit.record.hash.is_none() {
                        unit.record.hash = hash.clone();
                        if let Some(bytes) = bytes {
                            unit.record.size = *bytes;
                        }
                        if let Some(modified) = source_modified {
                            unit.record.modified = *modified;
                        }
                    }
                }
                Ok(())
            }
            Event::Hash { hash } => {
                let unit = self.unit_mut(unit_id)?;
                if unit.record.hash.is_none() {
                    unit.record.hash = Some(hash.clone());
                }
                Ok(())
            }
            Event::Verdict { verdict } => {
                if !self.units.contains_key(&verdict.unit_id) {
                    return Err(format!("verdict for unknown unit {}", verdict.unit_id));
                }
                self.verdicts.push(verdict.clone());
                Ok(())
            }
            Event::Skipped { skip } => {
                self.skipped.insert(skip.path.clone(), skip.clone());
                Ok(())
            }
            Event::Discard => {
                let id = unit_id.ok_or_else(|| "discard without unit id".to_string())?;
                let unit = self
                    .units
                    .remove(id)
                    .ok_or_else(|| format!("discard of unknown unit {}", id))?;
                if let Some(slot) = self
                    .positions
                    .remove(id)
                    .and_then(|pos| self.order.get_mut(pos))
                {
                    *slot = None;
                }
                self.by_source.remove(&unit.record.source_path);
                self.claimed.remove(&unit.destination);
                Ok(())
            }
        }
    }

    fn unit_mut(&mut self, id: Option<&UnitId>) -> Result<&mut TransferUnit, String> {
        let id = id.ok_or_else(|| "record without unit id".to_string())?;
        self.units
            .get_mut(id)
            .ok_or_else(|| format!("record for unknown unit {}", id))
    }

    fn get(&self, id: &UnitId) -> EngineResult<&TransferUnit> {
        self.units
            .get(id)
            .ok_or_else(|| EngineError::UnknownUnit { unit: id.clone() })
    }

    fn in_order(&self) -> impl Iterator<Item = &TransferUnit> {
        self.order
            .iter()
            .flatten()
            .filter_map(|id| self.units.get(id))
    }
}

/// Durable sink for manifest lines.
trait Journal: Send {
    /// Write one complete line and make it durable.
    fn append_line(&mut self, line: &[u8]) -> io::Result<()>;

    /// Cut the log back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Journal for File {
    fn append_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_all(line)?;
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

struct Inner {
    writer: Option<Box<dyn Journal>>,
    /// Length of the log up to the last complete record
    committed: u64,
    /// Set when a partial record could not be cut off
    broken: bool,
    next_seq: u64,
    index: Index,
}

/// Append-only store of transfer units, safe to share between workers.
pub struct ManifestStore {
    path: Option<PathBuf>,
    algorithm: ChecksumAlgorithm,
    max_attempts: u32,
    load_report: LoadReport,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("path", &self.path)
            .field("algorithm", &self.algorithm)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ManifestStore {
    /// Open (or create) a manifest file and replay it.
    ///
    /// # Arguments
    /// * `path` - Manifest file; missing parent directories are created
    /// * `algorithm` - Content hash the manifest is bound to
    /// * `max_attempts` - Copy attempts a unit may make before it stays Failed
    ///
    /// # Returns
    /// The store with every replayable record applied. Records that could not
    /// be replayed are listed in [`ManifestStore::load_report`].
    ///
    /// # Errors
    /// `ManifestIo` if the file cannot be created, read or truncated, and
    /// `AlgorithmMismatch` if the manifest was created with a different hash
    /// algorithm.
    pub fn open(
        path: impl AsRef<Path>,
        algorithm: ChecksumAlgorithm,
        max_attempts: u32,
    ) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::manifest_io("create directory", parent, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| EngineError::manifest_io("open", &path, e))?;

        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| EngineError::manifest_io("read", &path, e))?;

        let valid_len = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let mut report = LoadReport {
            torn_bytes: content.len() - valid_len,
            ..LoadReport::default()
        };
        if report.torn_bytes > 0 {
            warn!(
                path = %path.display(),
                bytes = report.torn_bytes,
                "discarding incomplete trailing manifest record"
            );
            file.set_len(valid_len as u64)
                .map_err(|e| EngineError::manifest_io("truncate", &path, e))?;
        }

        let mut index = Index::default();
        let mut stored_algorithm = None;
        let mut next_seq = 0;
        for (line_no, line) in content[..valid_len].split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let outcome = serde_json::from_slice::<Record>(line)
                .map_err(|e| e.to_string())
                .and_then(|record| {
                    if let Event::Header { algorithm, .. } = record.event {
                        stored_algorithm.get_or_insert(algorithm);
                    }
                    next_seq = next_seq.max(record.seq + 1);
                    index.apply(&record)
                });
            match outcome {
                Ok(()) => report.records += 1,
                Err(reason) => {
                    warn!(path = %path.display(), line = line_no + 1, %reason, "skipping corrupt manifest record");
                    report.corrupt.push(CorruptRecord {
                        line: line_no + 1,
                        reason,
                    });
                }
            }
        }

        if let Some(stored) = stored_algorithm {
            if stored != algorithm {
                return Err(EngineError::AlgorithmMismatch {
                    stored,
                    requested: algorithm,
                });
            }
        }

        let store = ManifestStore {
            path: Some(path.clone()),
            algorithm,
            max_attempts,
            load_report: report,
            inner: Mutex::new(Inner {
                writer: Some(Box::new(file)),
                committed: valid_len as u64,
                broken: false,
                next_seq,
                index,
            }),
        };

        if stored_algorithm.is_none() {
            if store.load_report.records > 0 {
                warn!(path = %path.display(), "manifest has no header; assuming {}", algorithm);
            }
            store.append(
                &mut store.lock(),
                None,
                Event::Header {
                    version: FORMAT_VERSION,
                    algorithm,
                },
            )?;
        }

        debug!(
            path = %path.display(),
            records = store.load_report.records,
            units = store.len(),
            "manifest loaded"
        );
        Ok(store)
    }

    /// A store that keeps everything in memory.
    pub fn in_memory(algorithm: ChecksumAlgorithm, max_attempts: u32) -> Self {
        ManifestStore {
            path: None,
            algorithm,
            max_attempts,
            load_report: LoadReport::default(),
            inner: Mutex::new(Inner {
                writer: None,
                committed: 0,
                broken: false,
                next_seq: 0,
                index: Index::default(),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one record durably, then apply it to the index.
    fn append(&self, inner: &mut Inner, unit_id: Option<UnitId>, event: Event) -> EngineResult<()> {
        let record = Record {
            seq: inner.next_seq,
            at: Utc::now(),
            unit_id,
            event,
        };

        let path = self.path.as_deref().unwrap_or_else(|| Path::new(""));
        if inner.broken {
            return Err(EngineError::manifest_io(
                "append",
                path,
                io::Error::new(
                    io::ErrorKind::Other,
                    "an earlier partial record could not be removed",
                ),
            ));
        }
        if let Some(writer) = inner.writer.as_mut() {
            let mut line = serde_json::to_vec(&record)
                .map_err(|source| EngineError::ManifestEncode { source })?;
            line.push(b'\n');
            if let Err(err) = writer.append_line(&line) {
                if let Err(cut) = writer.truncate(inner.committed) {
                    warn!(path = %path.display(), error = %cut, "could not remove partial manifest record");
                    inner.broken = true;
                }
                return Err(EngineError::manifest_io("append", path, err));
            }
            inner.committed += line.len() as u64;
        }

        inner.next_seq += 1;
        inner
            .index
            .apply(&record)
            .map_err(|reason| {
                EngineError::manifest_io(
                    "apply",
                    path,
                    io::Error::new(io::ErrorKind::InvalidData, reason),
                )
            })
    }

    /// Persist a Planned unit for a discovered file.
    ///
    /// Planning is idempotent per source path: a file that already has a unit
    /// gets that unit back unchanged. Otherwise the desired destination is
    /// disambiguated against claimed destinations and existing files.
    ///
    /// # Errors
    /// `DuplicateUnit` if the derived id already belongs to another source;
    /// nothing is written in that case. Otherwise only manifest I/O fails.
    pub fn plan_unit(
        &self,
        record: FileRecord,
        placement: PlacementRule,
        batch: usize,
        desired_destination: &Path,
    ) -> EngineResult<TransferUnit> {
        let mut inner = self.lock();
        if let Some(existing) = inner.index.by_source.get(&record.source_path) {
            return inner.index.get(existing).cloned();
        }

        let destination = disambiguate(desired_destination, |candidate| {
            inner.index.claimed.contains(candidate) || candidate.exists()
        });
        let id = UnitId::derive(&record.source_path, &destination);
        if let Some(existing) = inner.index.units.get(&id) {
            return Err(EngineError::DuplicateUnit {
                unit: id,
                source_path: record.source_path,
                existing: existing.record.source_path.clone(),
            });
        }

        let now = Utc::now();
        let unit = TransferUnit {
            id,
            record,
            destination,
            placement,
            batch,
            state: UnitState::Planned,
            attempts: 0,
            last_error: None,
            bytes_copied: 0,
            planned_at: now,
            updated_at: now,
        };

        self.append(
            &mut inner,
            Some(unit.id.clone()),
            Event::Plan { unit: unit.clone() },
        )?;
        debug!(unit = %unit.id, destination = %unit.destination.display(), "planned");
        Ok(unit)
    }

    /// Move a unit along one edge of the state graph.
    ///
    /// Entering Copying counts as an attempt. Rejected transitions leave the
    /// store untouched.
    ///
    /// # Returns
    /// The unit as it is after the transition
    ///
    /// # Errors
    /// `UnknownUnit`, `IllegalTransition` for a move that is not an edge, and
    /// `RetryLimitExceeded` for Failed -> Copying once `max_attempts` is used up.
    pub fn transition(
        &self,
        unit_id: &UnitId,
        to: UnitState,
        detail: TransitionDetail,
    ) -> EngineResult<TransferUnit> {
        let mut inner = self.lock();
        let unit = inner.index.get(unit_id)?;
        let from = unit.state;

        if !from.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                unit: unit_id.clone(),
                from,
                to,
            });
        }
        if from == UnitState::Failed && to == UnitState::Copying && unit.attempts >= self.max_attempts
        {
            return Err(EngineError::RetryLimitExceeded {
                unit: unit_id.clone(),
                max_attempts: self.max_attempts,
            });
        }

        let attempt = if to == UnitState::Copying {
            unit.attempts + 1
        } else {
            unit.attempts
        };
        self.append(
            &mut inner,
            Some(unit_id.clone()),
            Event::Transition {
                from,
                to,
                attempt,
                error: detail.error,
                hash: detail.hash,
                bytes: detail.bytes,
                source_modified: detail.source_modified,
            },
        )?;
        debug!(unit = %unit_id, %from, %to, attempt, "transition");
        inner.index.get(unit_id).cloned()
    }

    /// Attach a source hash computed outside a copy. No-op if one is stored.
    pub fn record_hash(&self, unit_id: &UnitId, hash: ChecksumValue) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.index.get(unit_id)?.record.hash.is_some() {
            return Ok(());
        }
        self.append(&mut inner, Some(unit_id.clone()), Event::Hash { hash })
    }

    /// Append a verdict; earlier verdicts are kept.
    pub fn record_verdict(&self, verdict: VerificationVerdict) -> EngineResult<()> {
        let mut inner = self.lock();
        inner.index.get(&verdict.unit_id)?;
        self.append(
            &mut inner,
            Some(verdict.unit_id.clone()),
            Event::Verdict { verdict },
        )
    }

    /// Record a file skipped during discovery. Repeating an identical skip is a no-op.
    pub fn record_skip(&self, skip: SkipRecord) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.index.skipped.get(&skip.path) == Some(&skip) {
            return Ok(());
        }
        self.append(&mut inner, None, Event::Skipped { skip })
    }

    /// Remove a Planned unit and release its destination.
    pub fn discard(&self, unit_id: &UnitId) -> EngineResult<()> {
        let mut inner = self.lock();
        let state = inner.index.get(unit_id)?.state;
        if state != UnitState::Planned {
            return Err(EngineError::NotDiscardable {
                unit: unit_id.clone(),
                state,
            });
        }
        self.append(&mut inner, Some(unit_id.clone()), Event::Discard)
    }

    pub fn unit(&self, unit_id: &UnitId) -> Option<TransferUnit> {
        self.lock().index.units.get(unit_id).cloned()
    }

    /// The unit planned for a source file, if any.
    pub fn unit_for_source(&self, source: &Path) -> Option<TransferUnit> {
        let inner = self.lock();
        inner
            .index
            .by_source
            .get(source)
            .and_then(|id| inner.index.units.get(id))
            .cloned()
    }

    /// Units matching the filter, in plan order.
    pub fn query(&self, filter: &UnitFilter) -> Vec<TransferUnit> {
        let inner = self.lock();
        inner
            .index
            .in_order()
            .filter(|unit| filter.matches(unit))
            .cloned()
            .collect()
    }

    /// Units the verifier may read: Copied or Verified, never mid-copy.
    pub fn verifiable(&self, filter: &UnitFilter) -> Vec<TransferUnit> {
        self.query(filter)
            .into_iter()
            .filter(|unit| matches!(unit.state, UnitState::Copied | UnitState::Verified))
            .collect()
    }

    /// Every verdict ever recorded, oldest first.
    pub fn verdicts(&self) -> Vec<VerificationVerdict> {
        self.lock().index.verdicts.clone()
    }

    /// The most recent verdict per unit, in plan order.
    pub fn latest_verdicts(&self) -> Vec<VerificationVerdict> {
        let inner = self.lock();
        let mut latest: HashMap<&UnitId, &VerificationVerdict> = HashMap::new();
        for verdict in &inner.index.verdicts {
            latest.insert(&verdict.unit_id, verdict);
        }
        inner
            .index
            .in_order()
            .filter_map(|unit| latest.get(&unit.id).map(|v| (*v).clone()))
            .collect()
    }

    pub fn skipped(&self) -> Vec<SkipRecord> {
        self.lock().index.skipped.values().cloned().collect()
    }

    /// Index for the next batch planned into this store.
    pub fn next_batch_index(&self) -> usize {
        self.lock()
            .index
            .units
            .values()
            .map(|unit| unit.batch + 1)
            .max()
            .unwrap_or(0)
    }

    /// Every planned batch, in batch order, units in plan order.
    pub fn batches(&self) -> Vec<Batch> {
        let inner = self.lock();
        let mut grouped: BTreeMap<usize, Vec<UnitId>> = BTreeMap::new();
        for unit in inner.index.in_order() {
            grouped.entry(unit.batch).or_default().push(unit.id.clone());
        }
        grouped
            .into_iter()
            .map(|(index, units)| Batch { index, units })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().index.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
