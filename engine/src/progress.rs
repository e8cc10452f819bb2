//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! pipeline from any specific front end. The CLI implements it to print to
//! stderr; tests implement it to count events.

use crate::error::UnitError;
use crate::model::{Summary, TransferUnit};

/// Receives progress updates from an `execute` run.
///
/// Methods are called from worker threads, so implementations must be
/// thread-safe. Every method has an empty default.
pub trait ProgressCallback: Send + Sync {
    /// Called once before any unit starts, with the number of units queued.
    fn on_run_started(&self, _units: usize, _bytes: u64) {}

    /// Called when a unit enters Copying.
    fn on_unit_started(&self, _unit: &TransferUnit) {}

    /// Called when an attempt failed and the unit will be retried after a delay.
    fn on_unit_retry(&self, _unit: &TransferUnit, _error: &UnitError) {}

    /// Called when a unit reached Copied or gave up in Failed.
    fn on_unit_completed(&self, _unit: &TransferUnit) {}

    /// Called after the pool drained.
    fn on_run_completed(&self, _summary: &Summary) {}
}

/// A callback that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {}
