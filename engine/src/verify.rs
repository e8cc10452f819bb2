//! Verification of completed transfers.
//!
//! Every Copied or Verified unit is re-checked against its FileRecord:
//! - destination hash against the hash measured during the copy
//! - destination size against the copied size
//! - destination mtime against the source mtime, within a tolerance
//!
//! Hash and size decide Pass or Fail. Timestamp drift only ever downgrades a
//! Pass to Pass-with-warning. A source that can no longer be read yields a
//! Skipped verdict: there is nothing left to judge the copy against.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::checksums::{compute_file_checksum, ChecksumValue};
use crate::error::EngineResult;
use crate::fs_ops::stat;
use crate::manifest::{ManifestStore, TransitionDetail, UnitFilter};
use crate::model::{
    QualityScore, Severity, TransferUnit, UnitState, VerdictClass, VerificationVerdict,
};
use crate::session::RunContext;
use crate::worker::run_pool;

/// How verification runs.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Allowed mtime difference before a warning is raised
    pub tolerance: Duration,
    pub concurrency: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            tolerance: Duration::from_secs(2),
            concurrency: 4,
        }
    }
}

/// Verify every verifiable unit matching `filter`.
///
/// Verdicts are appended to the store; passing Copied units become Verified.
/// Returns the new verdicts in plan order.
pub fn verify(
    store: &ManifestStore,
    filter: &UnitFilter,
    options: &VerifyOptions,
    ctx: &RunContext,
) -> EngineResult<Vec<VerificationVerdict>> {
    let units = store.verifiable(filter);
    let position: HashMap<_, _> = units
        .iter()
        .enumerate()
        .map(|(i, unit)| (unit.id.clone(), i))
        .collect();
    info!(run_id = %ctx.run_id(), units = units.len(), "verification started");

    let results = run_pool(units, options.concurrency, ctx.cancellation(), |unit| {
        verify_unit(store, &unit, options.tolerance)
    });
    let mut verdicts = results.into_iter().collect::<EngineResult<Vec<_>>>()?;
    verdicts.sort_by_key(|v| position.get(&v.unit_id).copied().unwrap_or(usize::MAX));

    let score = quality_score(&verdicts);
    info!(
        run_id = %ctx.run_id(),
        verified = score.total,
        passed = score.passed,
        failed = score.failed,
        skipped = score.skipped,
        severity = %score.severity,
        "verification finished"
    );
    Ok(verdicts)
}

fn verify_unit(
    store: &ManifestStore,
    unit: &TransferUnit,
    tolerance: Duration,
) -> EngineResult<VerificationVerdict> {
    let verdict = match judge(store, unit, tolerance) {
        Judgement::Verdict(verdict) => verdict,
        Judgement::SourceHash(hash) => {
            store.record_hash(&unit.id, hash)?;
            let refreshed = store.unit(&unit.id).unwrap_or_else(|| unit.clone());
            match judge(store, &refreshed, tolerance) {
                Judgement::Verdict(verdict) => verdict,
                Judgement::SourceHash(_) => skipped(unit, "source hash could not be recorded"),
            }
        }
    };

    store.record_verdict(verdict.clone())?;
    if verdict.classification.is_pass() && unit.state == UnitState::Copied {
        store.transition(&unit.id, UnitState::Verified, TransitionDetail::none())?;
    }
    if verdict.classification == VerdictClass::Fail {
        warn!(unit = %unit.id, reason = verdict.reason.as_deref().unwrap_or(""), "verification failed");
    } else {
        debug!(unit = %unit.id, classification = %verdict.classification, "verified");
    }
    Ok(verdict)
}

enum Judgement {
    Verdict(VerificationVerdict),
    /// The unit had no stored hash; this one was computed from the source
    SourceHash(ChecksumValue),
}

fn judge(store: &ManifestStore, unit: &TransferUnit, tolerance: Duration) -> Judgement {
    let record = &unit.record;
    let mut warnings = Vec::new();

    let (source_size, source_modified) = match stat(&record.source_path) {
        Ok(current) => current,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Judgement::Verdict(skipped(unit, "source missing"))
        }
        Err(e) => {
            return Judgement::Verdict(skipped(unit, &format!("source unreadable: {}", e)))
        }
    };

    let expected = match (record.cached_hash(source_size, source_modified), &record.hash) {
        (Some(hash), _) => hash.clone(),
        (None, Some(hash)) => {
            warnings.push("source modified since copy".to_string());
            hash.clone()
        }
        (None, None) => {
            return match compute_file_checksum(&record.source_path, store.algorithm()) {
                Ok(hash) => Judgement::SourceHash(hash),
                Err(e) => Judgement::Verdict(skipped(unit, &format!("source unreadable: {}", e))),
            }
        }
    };

    let (dest_size, dest_modified) = match stat(&unit.destination) {
        Ok(current) => current,
        Err(e) => {
            let reason = if e.kind() == io::ErrorKind::NotFound {
                "destination missing".to_string()
            } else {
                format!("destination unreadable: {}", e)
            };
            return Judgement::Verdict(failed(unit, reason));
        }
    };
    let destination_hash = match compute_file_checksum(&unit.destination, store.algorithm()) {
        Ok(hash) => hash,
        Err(e) => return Judgement::Verdict(failed(unit, format!("destination unreadable: {}", e))),
    };

    let hash_match = destination_hash == expected;
    let size_match = dest_size == record.size;
    let delta = (dest_modified - record.modified).num_milliseconds() as f64 / 1000.0;

    let mut problems = Vec::new();
    if !hash_match {
        problems.push("content mismatch");
    }
    if !size_match {
        problems.push("size mismatch");
    }
    if delta.abs() > tolerance.as_secs_f64() {
        warnings.push(format!("timestamp drift of {:.1}s exceeds tolerance", delta));
    }

    let (classification, reason) = if !problems.is_empty() {
        (VerdictClass::Fail, Some(problems.join(", ")))
    } else if !warnings.is_empty() {
        (VerdictClass::PassWithWarning, Some(warnings.join("; ")))
    } else {
        (VerdictClass::Pass, None)
    };

    Judgement::Verdict(VerificationVerdict {
        unit_id: unit.id.clone(),
        verified_at: Utc::now(),
        hash_match,
        size_match,
        timestamp_delta_secs: Some(delta),
        classification,
        reason,
        destination_hash: Some(destination_hash),
    })
}

fn skipped(unit: &TransferUnit, reason: &str) -> VerificationVerdict {
    VerificationVerdict {
        unit_id: unit.id.clone(),
        verified_at: Utc::now(),
        hash_match: false,
        size_match: false,
        timestamp_delta_secs: None,
        classification: VerdictClass::Skipped,
        reason: Some(reason.to_string()),
        destination_hash: None,
    }
}

fn failed(unit: &TransferUnit, reason: String) -> VerificationVerdict {
    VerificationVerdict {
        unit_id: unit.id.clone(),
        verified_at: Utc::now(),
        hash_match: false,
        size_match: false,
        timestamp_delta_secs: None,
        classification: VerdictClass::Fail,
        reason: Some(reason),
        destination_hash: None,
    }
}

/// Aggregate a verdict set. Pure: the same verdicts always score the same.
///
/// Skipped verdicts count toward the total, so they lower the pass fraction.
/// An empty set scores as Excellent.
pub fn quality_score(verdicts: &[VerificationVerdict]) -> QualityScore {
    let total = verdicts.len();
    let count = |class: VerdictClass| {
        verdicts
            .iter()
            .filter(|v| v.classification == class)
            .count()
    };
    let warnings = count(VerdictClass::PassWithWarning);
    let passed = count(VerdictClass::Pass) + warnings;
    let failed = count(VerdictClass::Fail);
    let skipped = count(VerdictClass::Skipped);

    let fraction = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

    // integer comparisons keep the bucket edges exact
    let severity = if total == 0 || passed * 1000 >= total * 999 {
        Severity::Excellent
    } else if passed * 100 >= total * 99 {
        Severity::Good
    } else if passed * 100 >= total * 95 {
        Severity::Degraded
    } else {
        Severity::Poor
    };

    QualityScore {
        total,
        passed,
        warnings,
        failed,
        skipped,
        pass_fraction: fraction(passed),
        fail_fraction: fraction(failed),
        skip_fraction: fraction(skipped),
        severity,
    }
}
