//! # Carryover Engine - File Migration Library
//!
//! A headless engine for moving a file collection to new storage, built as the
//! foundation for the `carryover` CLI and any other front end.
//!
//! ## Overview
//!
//! A migration runs in three separate phases:
//! - **Plan**: walk the source roots, classify every file (including legacy
//!   formats such as WordPerfect or Lotus 1-2-3) and persist one Planned
//!   transfer unit per file in a durable manifest
//! - **Execute**: copy units on a bounded worker pool, hashing as the bytes
//!   stream, with per-unit retries and cooperative cancellation
//! - **Verify**: re-read each destination, compare hash, size and timestamp,
//!   and score the result
//!
//! Every state change is appended to the manifest before it takes effect, so
//! an interrupted run resumes where it stopped and never copies a unit twice.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use carryover_engine::{migrate, CancellationToken, ManifestStore, MigrationConfig, NoProgress};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MigrationConfig::load("carryover.toml".as_ref())?;
//! let store = ManifestStore::open(
//!     config.manifest_path(),
//!     config.hash_algorithm,
//!     config.max_attempts(),
//! )?;
//!
//! let outcome = migrate(&config, &store, &NoProgress, CancellationToken::new())?;
//! println!("{} bytes moved", outcome.summary.bytes_moved);
//! if let Some(score) = outcome.score {
//!     println!("quality: {}", score.severity);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (FileRecord, TransferUnit, verdicts)
//! - **error**: Run-level and per-unit error types
//! - **classify**: Category and legacy-format detection, destination placement
//! - **manifest**: Append-only manifest store
//! - **fs_ops**: Discovery walk and hashing copy
//! - **pipeline**: Plan, execute and rollback
//! - **verify**: Verification engine and quality scoring
//! - **report**: Text and JSON rendering
//! - **config**: TOML configuration
//! - **session**: Per-run context and cancellation
//! - **worker**: Bounded worker pool
//! - **progress**: Progress callback trait
//! - **checksums**: Checksum computation

pub mod checksums;
pub mod classify;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod session;
pub mod verify;
pub mod worker;

// Re-export main types and functions
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, ChecksumValue};
pub use classify::{Classifier, ClassifierOptions, LegacyFormat, LegacyKind};
pub use config::{ConfigError, MigrationConfig};
pub use error::{EngineError, EngineResult, UnitError, UnitErrorKind};
pub use manifest::{LoadReport, ManifestStore, UnitFilter};
pub use model::{
    Batch, Category, FileRecord, PlacementRule, QualityScore, Severity, Summary, TransferUnit,
    UnitId, UnitState, VerdictClass, VerificationVerdict,
};
pub use pipeline::{
    migrate, ExecuteOptions, MigrationOutcome, Migrator, PlanOptions, RollbackReport,
    RollbackTarget,
};
pub use progress::{NoProgress, ProgressCallback};
pub use session::{CancellationToken, RunContext};
pub use verify::{quality_score, verify, VerifyOptions};
