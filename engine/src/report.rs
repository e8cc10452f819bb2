//! Report rendering.
//!
//! Turns run results into operator-facing text, JSON, or a checksum listing.
//! Nothing here changes the manifest; every function reads plain data.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checksums::{generate_checksum_file, ChecksumValue};
use crate::error::UnitError;
use crate::manifest::{ManifestStore, UnitFilter};
use crate::model::{
    path_serde, QualityScore, SkipRecord, Summary, UnitId, UnitState, VerdictClass,
    VerificationVerdict,
};
use crate::pipeline::RollbackReport;
use crate::verify::quality_score;

/// Human-readable byte count, e.g. `1.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Human-readable duration, e.g. `1h 2m 3s`.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Serialize any report as pretty JSON.
pub fn to_json<T: Serialize + ?Sized>(report: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// A unit that ended Failed, with what went wrong last.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    #[serde(with = "path_serde")]
    pub source: PathBuf,
    pub attempts: u32,
    pub last_error: Option<UnitError>,
}

/// A verdict that was not a clean pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictDiagnostic {
    pub unit_id: UnitId,
    #[serde(with = "path_serde::option")]
    pub source: Option<PathBuf>,
    #[serde(with = "path_serde::option")]
    pub destination: Option<PathBuf>,
    pub classification: VerdictClass,
    pub reason: Option<String>,
}

/// Quality score plus everything an operator needs to follow up on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub generated_at: DateTime<Utc>,
    pub score: QualityScore,
    pub diagnostics: Vec<VerdictDiagnostic>,
    pub failed_units: Vec<FailedUnit>,
}

impl VerificationReport {
    /// Build from a verdict set, resolving paths through the store.
    pub fn build(store: &ManifestStore, verdicts: &[VerificationVerdict]) -> Self {
        let diagnostics = verdicts
            .iter()
            .filter(|verdict| verdict.classification != VerdictClass::Pass)
            .map(|verdict| {
                let unit = store.unit(&verdict.unit_id);
                VerdictDiagnostic {
                    unit_id: verdict.unit_id.clone(),
                    source: unit.as_ref().map(|u| u.record.source_path.clone()),
                    destination: unit.map(|u| u.destination),
                    classification: verdict.classification,
                    reason: verdict.reason.clone(),
                }
            })
            .collect();

        VerificationReport {
            generated_at: Utc::now(),
            score: quality_score(verdicts),
            diagnostics,
            failed_units: failed_units(store),
        }
    }

    /// Whether any verdict failed or any unit is stuck in Failed.
    pub fn has_failures(&self) -> bool {
        self.score.failed > 0 || !self.failed_units.is_empty()
    }
}

/// Every Failed unit in the store, in plan order.
pub fn failed_units(store: &ManifestStore) -> Vec<FailedUnit> {
    store
        .query(&UnitFilter::in_states(&[UnitState::Failed]))
        .into_iter()
        .map(|unit| FailedUnit {
            unit_id: unit.id,
            source: unit.record.source_path,
            attempts: unit.attempts,
            last_error: unit.last_error,
        })
        .collect()
}

/// Snapshot of a whole manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(with = "path_serde::option")]
    pub manifest: Option<PathBuf>,
    pub algorithm: String,
    pub units: usize,
    pub batches: usize,
    pub by_state: BTreeMap<UnitState, usize>,
    pub bytes_copied: u64,
    pub skipped: Vec<SkipRecord>,
    pub corrupt_records: usize,
    /// Score over the latest verdict per unit, if anything was verified
    pub score: Option<QualityScore>,
    pub failed_units: Vec<FailedUnit>,
}

impl StatusReport {
    pub fn collect(store: &ManifestStore) -> Self {
        let units = store.query(&UnitFilter::all());
        let mut by_state = BTreeMap::new();
        for unit in &units {
            *by_state.entry(unit.state).or_insert(0) += 1;
        }
        let latest = store.latest_verdicts();

        StatusReport {
            manifest: store.path().map(Path::to_path_buf),
            algorithm: store.algorithm().to_string(),
            units: units.len(),
            batches: store.next_batch_index(),
            by_state,
            bytes_copied: units.iter().map(|u| u.bytes_copied).sum(),
            skipped: store.skipped(),
            corrupt_records: store.load_report().corrupt.len(),
            score: (!latest.is_empty()).then(|| quality_score(&latest)),
            failed_units: failed_units(store),
        }
    }
}

fn write_states(out: &mut String, by_state: &BTreeMap<UnitState, usize>) {
    let counts: Vec<String> = UnitState::all()
        .iter()
        .filter_map(|state| {
            by_state
                .get(state)
                .filter(|count| **count > 0)
                .map(|count| format!("{} {}", count, state))
        })
        .collect();
    if counts.is_empty() {
        let _ = writeln!(out, "Units: none");
    } else {
        let _ = writeln!(out, "Units: {}", counts.join(", "));
    }
}

fn write_failed_units(out: &mut String, failed: &[FailedUnit]) {
    if failed.is_empty() {
        return;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Failed units:");
    for unit in failed {
        match &unit.last_error {
            Some(error) => {
                let _ = writeln!(
                    out,
                    "  {} {} (after {} attempts): {}",
                    unit.unit_id,
                    unit.source.display(),
                    unit.attempts,
                    error
                );
            }
            None => {
                let _ = writeln!(out, "  {} {}", unit.unit_id, unit.source.display());
            }
        }
    }
}

fn write_score(out: &mut String, score: &QualityScore) {
    let _ = writeln!(
        out,
        "Quality: {} ({:.1}% pass, {} of {} verified)",
        score.severity,
        score.pass_fraction * 100.0,
        score.passed,
        score.total
    );
    let _ = writeln!(
        out,
        "Verdicts: {} passed ({} with warnings), {} failed, {} skipped",
        score.passed, score.warnings, score.failed, score.skipped
    );
}

/// Text rendering of an execute run.
pub fn render_summary(summary: &Summary, failed: &[FailedUnit]) -> String {
    let mut out = String::new();
    let title = match (summary.dry_run, summary.cancelled) {
        (true, _) => "Dry run complete",
        (false, true) => "Run cancelled",
        (false, false) => "Run complete",
    };
    let _ = writeln!(out, "{} (run {})", title, summary.run_id);
    write_states(&mut out, &summary.by_state);
    if summary.skipped_in_manifest > 0 {
        let _ = writeln!(
            out,
            "Skipped during discovery (all plans): {}",
            summary.skipped_in_manifest
        );
    }
    let _ = writeln!(out, "Bytes copied: {}", format_bytes(summary.bytes_moved));
    if summary.retries > 0 {
        let _ = writeln!(out, "Retries: {}", summary.retries);
    }
    let _ = writeln!(out, "Elapsed: {}", format_duration(summary.elapsed));

    let relevant: Vec<FailedUnit> = failed
        .iter()
        .filter(|unit| summary.failed_units.contains(&unit.unit_id))
        .cloned()
        .collect();
    write_failed_units(&mut out, &relevant);
    out
}

/// Text rendering of a verification pass.
pub fn render_verification(report: &VerificationReport) -> String {
    let mut out = String::new();
    write_score(&mut out, &report.score);

    if !report.diagnostics.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Diagnostics:");
        for diagnostic in &report.diagnostics {
            let path = diagnostic
                .destination
                .as_deref()
                .or(diagnostic.source.as_deref())
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| diagnostic.unit_id.to_string());
            let _ = writeln!(
                out,
                "  [{}] {}: {}",
                diagnostic.classification,
                path,
                diagnostic.reason.as_deref().unwrap_or("(no reason recorded)")
            );
        }
    }
    write_failed_units(&mut out, &report.failed_units);
    out
}

/// Text rendering of a rollback.
pub fn render_rollback(report: &RollbackReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Rollback: {} rolled back, {} discarded, {} rejected, {} deletion failures",
        report.rolled_back.len(),
        report.discarded.len(),
        report.rejected.len(),
        report.deletion_failures.len()
    );
    for issue in &report.rejected {
        let _ = writeln!(out, "  rejected {}: {}", issue.unit_id, issue.reason);
    }
    for issue in &report.deletion_failures {
        let _ = writeln!(out, "  not deleted {}: {}", issue.unit_id, issue.reason);
    }
    out
}

/// Text rendering of a manifest snapshot.
pub fn render_status(status: &StatusReport) -> String {
    let mut out = String::new();
    match &status.manifest {
        Some(path) => {
            let _ = writeln!(out, "Manifest: {} ({})", path.display(), status.algorithm);
        }
        None => {
            let _ = writeln!(out, "Manifest: in memory ({})", status.algorithm);
        }
    }
    let _ = writeln!(out, "Batches: {}", status.batches);
    write_states(&mut out, &status.by_state);
    let _ = writeln!(out, "Bytes copied: {}", format_bytes(status.bytes_copied));
    if !status.skipped.is_empty() {
        let _ = writeln!(out, "Skipped during discovery: {}", status.skipped.len());
        for skip in &status.skipped {
            let _ = writeln!(out, "  {}: {}", skip.path.display(), skip.reason);
        }
    }
    if status.corrupt_records > 0 {
        let _ = writeln!(out, "Corrupt manifest records: {}", status.corrupt_records);
    }
    if let Some(score) = &status.score {
        write_score(&mut out, score);
    }
    write_failed_units(&mut out, &status.failed_units);
    out
}

/// Checksum listing of every Verified unit matching `filter`.
///
/// Paths are relative to `destination_root`, so the listing can be checked
/// from inside the archive.
pub fn checksum_listing(
    store: &ManifestStore,
    filter: &UnitFilter,
    destination_root: &Path,
) -> String {
    let entries: Vec<(String, ChecksumValue)> = store
        .query(filter)
        .into_iter()
        .filter(|unit| unit.state == UnitState::Verified)
        .filter_map(|unit| {
            let hash = unit.record.hash?;
            let relative = unit
                .destination
                .strip_prefix(destination_root)
                .unwrap_or(&unit.destination)
                .to_string_lossy()
                .replace('\\', "/");
            Some((relative, hash))
        })
        .collect();
    generate_checksum_file(&entries, store.algorithm())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::error::UnitErrorKind;
    use crate::manifest::TransitionDetail;
    use crate::model::{Category, FileRecord, PlacementRule, Severity};
    use crate::pipeline::RollbackIssue;
    use uuid::Uuid;

    fn planned(store: &ManifestStore, name: &str) -> UnitId {
        let record = FileRecord {
            source_path: PathBuf::from("/src/root").join(name),
            source_root: PathBuf::from("/src/root"),
            size: 4,
            modified: Utc::now(),
            category: Category::Document,
            hash: None,
        };
        store
            .plan_unit(
                record,
                PlacementRule::PreserveRelativePath,
                0,
                &Path::new("/dst/Documents/root").join(name),
            )
            .expect("plan")
            .id
    }

    fn verdict(unit_id: &UnitId, classification: VerdictClass, reason: Option<&str>) -> VerificationVerdict {
        VerificationVerdict {
            unit_id: unit_id.clone(),
            verified_at: Utc::now(),
            hash_match: classification != VerdictClass::Fail,
            size_match: true,
            timestamp_delta_secs: Some(0.0),
            classification,
            reason: reason.map(str::to_string),
            destination_hash: None,
        }
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
    }

    #[test]
    fn test_verification_report_lists_non_pass_verdicts() {
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 2);
        let good = planned(&store, "good.txt");
        let bad = planned(&store, "bad.txt");
        let verdicts = vec![
            verdict(&good, VerdictClass::Pass, None),
            verdict(&bad, VerdictClass::Fail, Some("content mismatch")),
        ];

        let report = VerificationReport::build(&store, &verdicts);
        assert!(report.has_failures());
        assert_eq!(report.score.severity, Severity::Poor);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].unit_id, bad);

        let text = render_verification(&report);
        assert!(text.contains("Quality: Poor (50.0% pass, 1 of 2 verified)"));
        assert!(text.contains("[fail] /dst/Documents/root/bad.txt: content mismatch"));

        let json = to_json(&report).expect("json");
        assert!(json.contains("\"classification\": \"fail\""));
    }

    #[test]
    fn test_summary_lists_failed_units_with_errors() {
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 1);
        let id = planned(&store, "gone.txt");
        store
            .transition(&id, UnitState::Copying, TransitionDetail::none())
            .expect("copying");
        store
            .transition(
                &id,
                UnitState::Failed,
                TransitionDetail::failed(UnitError {
                    kind: UnitErrorKind::SourceUnreadable,
                    message: "/src/root/gone.txt: not found".to_string(),
                    os_code: Some(2),
                }),
            )
            .expect("failed");

        let summary = Summary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            dry_run: false,
            cancelled: false,
            by_state: BTreeMap::from([(UnitState::Failed, 1)]),
            skipped_in_manifest: 3,
            bytes_moved: 2048,
            retries: 0,
            elapsed: Duration::from_secs(65),
            failed_units: vec![id.clone()],
        };

        let text = render_summary(&summary, &failed_units(&store));
        assert!(text.starts_with("Run complete"));
        assert!(text.contains("Units: 1 failed"));
        assert!(text.contains("Bytes copied: 2.00 KB"));
        assert!(text.contains("Skipped during discovery (all plans): 3"));
        assert!(text.contains("Elapsed: 1m 5s"));
        assert!(text.contains("source unreadable: /src/root/gone.txt: not found (os error 2)"));
    }

    #[test]
    fn test_rollback_rendering() {
        let report = RollbackReport {
            rolled_back: vec![UnitId::from_hex("aa")],
            discarded: vec![],
            rejected: vec![RollbackIssue {
                unit_id: UnitId::from_hex("bb"),
                reason: "unit is verified".to_string(),
            }],
            deletion_failures: vec![],
        };
        let text = render_rollback(&report);
        assert!(text.starts_with("Rollback: 1 rolled back, 0 discarded, 1 rejected, 0 deletion failures"));
        assert!(text.contains("rejected bb: unit is verified"));
    }

    #[test]
    fn test_status_counts_states() {
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Sha256, 2);
        planned(&store, "a.txt");
        planned(&store, "b.txt");
        let status = StatusReport::collect(&store);
        assert_eq!(status.units, 2);
        assert_eq!(status.batches, 1);
        assert!(status.score.is_none());
        let text = render_status(&status);
        assert!(text.contains("Manifest: in memory (sha256)"));
        assert!(text.contains("Units: 2 planned"));
    }

    #[test]
    fn test_checksum_listing_uses_relative_destinations() {
        let store = ManifestStore::in_memory(ChecksumAlgorithm::Blake3, 2);
        let id = planned(&store, "a.txt");
        let hash = ChecksumValue::new(ChecksumAlgorithm::Blake3, "abcd".to_string());
        store
            .transition(&id, UnitState::Copying, TransitionDetail::none())
            .expect("copying");
        store
            .transition(
                &id,
                UnitState::Copied,
                TransitionDetail::copied(hash, 4, Utc::now()),
            )
            .expect("copied");
        planned(&store, "b.txt");

        assert!(!checksum_listing(&store, &UnitFilter::all(), Path::new("/dst")).contains("abcd"));

        store
            .transition(&id, UnitState::Verified, TransitionDetail::none())
            .expect("verified");
        let listing = checksum_listing(&store, &UnitFilter::all(), Path::new("/dst"));
        assert!(listing.contains("; Algorithm: blake3"));
        assert!(listing.contains("abcd Documents/root/a.txt"));
        assert!(!listing.contains("b.txt"));
    }
}
