//! Core data model for migrations.
//!
//! This module defines the data structures shared by the pipeline, the
//! manifest store and the verifier:
//! - FileRecord: identity of one source file
//! - TransferUnit: one planned or executed copy, with its state
//! - Batch: an ordered group of units executed together
//! - VerificationVerdict / QualityScore: outcome of re-checking copies
//! - Summary: what an `execute` run did

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::classify::LegacyFormat;
use crate::error::UnitError;

/// Stable identifier of a transfer unit.
///
/// Derived from the source and destination paths, so planning the same file
/// to the same place always yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Derive the id for a source/destination pair.
    pub fn derive(source: &Path, destination: &Path) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_os_str().as_encoded_bytes());
        hasher.update(&[0]);
        hasher.update(destination.as_os_str().as_encoded_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.as_bytes()[..16]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        UnitId(hex)
    }

    /// Wrap an id read back from a manifest or typed by an operator.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        UnitId(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic category of a file.
///
/// Closed set: placement and reporting match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "format")]
pub enum Category {
    Document,
    Image,
    Video,
    Audio,
    Archive,
    LegacyFormat(LegacyFormat),
    Unknown,
}

impl Category {
    /// Top-level directory under the destination root.
    pub fn directory_name(&self) -> &'static str {
        match self {
            Category::Document => "Documents",
            Category::Image => "Images",
            Category::Video => "Videos",
            Category::Audio => "Audio",
            Category::Archive => "Archives",
            Category::LegacyFormat(_) => "Legacy",
            Category::Unknown => "Unknown",
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Category::LegacyFormat(_))
    }

    /// Key of this category in `size_limits_mb`.
    pub fn limit_key(&self) -> &'static str {
        match self {
            Category::Document => "document",
            Category::Image => "image",
            Category::Video => "video",
            Category::Audio => "audio",
            Category::Archive => "archive",
            Category::LegacyFormat(_) => "legacy",
            Category::Unknown => "unknown",
        }
    }

    pub const LIMIT_KEYS: [&'static str; 7] = [
        "document", "image", "video", "audio", "archive", "legacy", "unknown",
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Document => write!(f, "document"),
            Category::Image => write!(f, "image"),
            Category::Video => write!(f, "video"),
            Category::Audio => write!(f, "audio"),
            Category::Archive => write!(f, "archive"),
            Category::LegacyFormat(format) => write!(f, "legacy ({})", format.name()),
            Category::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where a unit lands relative to its category directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementRule {
    /// `<category>/<source root name>/<relative path>`
    PreserveRelativePath,
    /// `<category>/<YYYY>/<MM>/<file name>` from the last-modified time
    DateBucketed,
    /// `<category>/<file name>`
    Flat,
}

/// Identity of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute source path
    #[serde(with = "path_serde")]
    pub source_path: PathBuf,
    /// Source root this file was discovered under
    #[serde(with = "path_serde")]
    pub source_root: PathBuf,
    /// Size in bytes at discovery time
    pub size: u64,
    /// Last-modified time at discovery time
    pub modified: DateTime<Utc>,
    pub category: Category,
    /// Content hash; filled by the copy (or once by the verifier) and then fixed
    pub hash: Option<ChecksumValue>,
}

impl FileRecord {
    /// Path of the source relative to its root.
    pub fn relative_path(&self) -> &Path {
        self.source_path
            .strip_prefix(&self.source_root)
            .unwrap_or(&self.source_path)
    }

    /// The stored hash, but only while the source still looks unchanged.
    ///
    /// Size and mtime (to the second) must both match what was recorded.
    pub fn cached_hash(&self, size: u64, modified: DateTime<Utc>) -> Option<&ChecksumValue> {
        if size == self.size && modified.timestamp() == self.modified.timestamp() {
            self.hash.as_ref()
        } else {
            None
        }
    }
}

/// Lifecycle state of a transfer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Planned,
    Copying,
    Copied,
    Verified,
    Failed,
    RolledBack,
}

impl UnitState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Verified | UnitState::RolledBack)
    }

    /// Whether `self -> to` is an edge of the state graph.
    ///
    /// The only backward edges are Copied -> RolledBack and Failed -> Copying.
    pub fn can_transition_to(&self, to: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, to),
            (Planned, Copying)
                | (Copying, Copied)
                | (Copying, Failed)
                | (Copied, Verified)
                | (Failed, Copying)
                | (Failed, RolledBack)
                | (Copied, RolledBack)
        )
    }

    pub fn all() -> [UnitState; 6] {
        use UnitState::*;
        [Planned, Copying, Copied, Verified, Failed, RolledBack]
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Planned => "planned",
            UnitState::Copying => "copying",
            UnitState::Copied => "copied",
            UnitState::Verified => "verified",
            UnitState::Failed => "failed",
            UnitState::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// One planned or executed copy operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUnit {
    pub id: UnitId,
    pub record: FileRecord,
    /// Destination path, disambiguated at plan time
    #[serde(with = "path_serde")]
    pub destination: PathBuf,
    pub placement: PlacementRule,
    /// Index of the batch this unit was planned into
    pub batch: usize,
    pub state: UnitState,
    /// Number of times the unit entered Copying
    pub attempts: u32,
    pub last_error: Option<UnitError>,
    /// Bytes written by the successful copy
    pub bytes_copied: u64,
    pub planned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered group of units processed together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub units: Vec<UnitId>,
}

/// Why a discovered file was not planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// Larger than the configured maximum
    Oversized { size: u64, limit: u64 },
    /// Could not be inspected (permission denied, vanished mid-walk)
    Unreadable { message: String },
    /// A symlink to a directory; the walk does not descend into it
    LinkedDirectory,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Oversized { size, limit } => {
                write!(f, "oversized ({} bytes, limit {})", size, limit)
            }
            SkipReason::Unreadable { message } => write!(f, "unreadable ({})", message),
            SkipReason::LinkedDirectory => write!(f, "symlinked directory, not followed"),
        }
    }
}

/// A file recorded as skipped during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRecord {
    #[serde(with = "path_serde")]
    pub path: PathBuf,
    pub category: Category,
    pub reason: SkipReason,
}

/// Outcome class of one verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictClass {
    Pass,
    PassWithWarning,
    Fail,
    /// The source could not be read, so the copy could not be judged
    Skipped,
}

impl VerdictClass {
    pub fn is_pass(&self) -> bool {
        matches!(self, VerdictClass::Pass | VerdictClass::PassWithWarning)
    }
}

impl fmt::Display for VerdictClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictClass::Pass => write!(f, "pass"),
            VerdictClass::PassWithWarning => write!(f, "pass (warning)"),
            VerdictClass::Fail => write!(f, "fail"),
            VerdictClass::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of re-checking one completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub unit_id: UnitId,
    pub verified_at: DateTime<Utc>,
    pub hash_match: bool,
    pub size_match: bool,
    /// Destination mtime minus recorded source mtime, in seconds (informational)
    pub timestamp_delta_secs: Option<f64>,
    pub classification: VerdictClass,
    /// Present whenever the classification is not Pass
    pub reason: Option<String>,
    pub destination_hash: Option<ChecksumValue>,
}

/// Severity bucket of a quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// >= 99.9% pass
    Excellent,
    /// >= 99% pass
    Good,
    /// >= 95% pass
    Degraded,
    /// < 95% pass
    Poor,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Excellent => write!(f, "Excellent"),
            Severity::Good => write!(f, "Good"),
            Severity::Degraded => write!(f, "Degraded"),
            Severity::Poor => write!(f, "Poor"),
        }
    }
}

/// Aggregate over a verdict set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub total: usize,
    /// Pass plus pass-with-warning
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pass_fraction: f64,
    pub fail_fraction: f64,
    pub skip_fraction: f64,
    pub severity: Severity,
}

/// What an `execute` run did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    /// Final state of every unit in the executed batches
    pub by_state: BTreeMap<UnitState, usize>,
    /// Discovery skips recorded in the manifest by every plan so far; not
    /// limited to the executed batches
    pub skipped_in_manifest: usize,
    /// Bytes written by successful copies in this run
    pub bytes_moved: u64,
    /// Copy attempts beyond the first, in this run
    pub retries: u64,
    pub elapsed: Duration,
    /// Units that ended Failed, for operator follow-up
    pub failed_units: Vec<UnitId>,
}

impl Summary {
    pub fn count(&self, state: UnitState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }

    pub fn total_units(&self) -> usize {
        self.by_state.values().sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_units.is_empty()
    }
}

/// Serde for paths that may not be valid UTF-8.
///
/// UTF-8 paths are written as plain strings. Anything else is written as
/// `{"raw": "<hex>"}` holding the platform encoding (bytes on Unix, UTF-16
/// code units on Windows), so every name a walk can return survives a
/// manifest round trip unchanged.
pub mod path_serde {
    use std::ffi::OsString;
    use std::path::{Path, PathBuf};

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Raw { raw: String },
    }

    pub fn serialize<S: Serializer>(path: &Path, serializer: S) -> Result<S::Ok, S::Error> {
        match path.to_str() {
            Some(text) => serializer.serialize_str(text),
            None => Repr::Raw {
                raw: hex(&to_raw(path)),
            }
            .serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PathBuf, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => Ok(PathBuf::from(text)),
            Repr::Raw { raw } => {
                let bytes = unhex(&raw).ok_or_else(|| D::Error::custom("malformed raw path"))?;
                from_raw(bytes)
                    .map(PathBuf::from)
                    .ok_or_else(|| D::Error::custom("raw path does not decode on this platform"))
            }
        }
    }

    /// Same encoding for `Option<PathBuf>`.
    pub mod option {
        use std::path::PathBuf;

        use serde::{Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] PathBuf);

        pub fn serialize<S: Serializer>(
            path: &Option<PathBuf>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match path {
                Some(path) => super::serialize(path, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<PathBuf>, D::Error> {
            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(path)| path))
        }
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn unhex(text: &str) -> Option<Vec<u8>> {
        if text.len() % 2 != 0 {
            return None;
        }
        (0..text.len())
            .step_by(2)
            .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
            .collect()
    }

    #[cfg(unix)]
    fn to_raw(path: &Path) -> Vec<u8> {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    }

    #[cfg(unix)]
    fn from_raw(bytes: Vec<u8>) -> Option<OsString> {
        use std::os::unix::ffi::OsStringExt;
        Some(OsString::from_vec(bytes))
    }

    #[cfg(windows)]
    fn to_raw(path: &Path) -> Vec<u8> {
        use std::os::windows::ffi::OsStrExt;
        path.as_os_str()
            .encode_wide()
            .flat_map(u16::to_le_bytes)
            .collect()
    }

    #[cfg(windows)]
    fn from_raw(bytes: Vec<u8>) -> Option<OsString> {
        use std::os::windows::ffi::OsStringExt;
        if bytes.len() % 2 != 0 {
            return None;
        }
        let wide: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Some(OsString::from_wide(&wide))
    }

    #[cfg(not(any(unix, windows)))]
    fn to_raw(path: &Path) -> Vec<u8> {
        path.to_string_lossy().into_owned().into_bytes()
    }

    #[cfg(not(any(unix, windows)))]
    fn from_raw(bytes: Vec<u8>) -> Option<OsString> {
        String::from_utf8(bytes).ok().map(OsString::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_is_stable_and_distinct() {
        let a = UnitId::derive(Path::new("/src/a.txt"), Path::new("/dst/a.txt"));
        let b = UnitId::derive(Path::new("/src/a.txt"), Path::new("/dst/a.txt"));
        let c = UnitId::derive(Path::new("/src/a.txt"), Path::new("/dst/a_1.txt"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(UnitState::Planned.can_transition_to(UnitState::Copying));
        assert!(UnitState::Copying.can_transition_to(UnitState::Copied));
        assert!(UnitState::Copied.can_transition_to(UnitState::Verified));
        assert!(UnitState::Copying.can_transition_to(UnitState::Failed));
    }

    #[test]
    fn test_only_two_backward_edges() {
        assert!(UnitState::Failed.can_transition_to(UnitState::Copying));
        assert!(UnitState::Copied.can_transition_to(UnitState::RolledBack));
        assert!(!UnitState::Copied.can_transition_to(UnitState::Copying));
        assert!(!UnitState::Copied.can_transition_to(UnitState::Planned));
        assert!(!UnitState::Copying.can_transition_to(UnitState::Planned));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in UnitState::all() {
            if state.is_terminal() {
                for to in UnitState::all() {
                    assert!(!state.can_transition_to(to), "{} -> {}", state, to);
                }
            }
        }
    }

    #[test]
    fn test_cached_hash_requires_unchanged_source() {
        let modified = Utc::now();
        let record = FileRecord {
            source_path: PathBuf::from("/src/root/a.txt"),
            source_root: PathBuf::from("/src/root"),
            size: 10,
            modified,
            category: Category::Document,
            hash: Some(ChecksumValue::new(
                crate::checksums::ChecksumAlgorithm::Blake3,
                "ab".to_string(),
            )),
        };
        assert!(record.cached_hash(10, modified).is_some());
        assert!(record.cached_hash(11, modified).is_none());
        assert!(record
            .cached_hash(10, modified + chrono::Duration::seconds(5))
            .is_none());
        assert_eq!(record.relative_path(), Path::new("a.txt"));
    }

    #[test]
    fn test_utf8_paths_serialize_as_plain_strings() {
        let skip = SkipRecord {
            path: PathBuf::from("/src/café.txt"),
            category: Category::Unknown,
            reason: SkipReason::LinkedDirectory,
        };
        let json = serde_json::to_string(&skip).expect("serialize");
        assert!(json.contains(r#""path":"/src/café.txt""#), "{}", json);
        let back: SkipRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, skip);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new("/src").join(OsStr::from_bytes(b"caf\xe9.txt"));
        let skip = SkipRecord {
            path: path.clone(),
            category: Category::Unknown,
            reason: SkipReason::Unreadable {
                message: "denied".to_string(),
            },
        };
        let json = serde_json::to_string(&skip).expect("non-UTF-8 path serializes");
        assert!(json.contains(r#""raw":"2f7372632f636166e92e747874""#), "{}", json);
        let back: SkipRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.path, path);
    }

    #[cfg(unix)]
    #[test]
    fn test_unit_id_distinguishes_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let a = Path::new("/src").join(OsStr::from_bytes(b"a\xff.txt"));
        let b = Path::new("/src").join(OsStr::from_bytes(b"a\xfe.txt"));
        let dst = Path::new("/dst/a.txt");
        assert_eq!(a.to_string_lossy(), b.to_string_lossy());
        assert_ne!(UnitId::derive(&a, dst), UnitId::derive(&b, dst));
    }

    #[test]
    fn test_category_serde_shape() {
        let json = serde_json::to_string(&Category::LegacyFormat(LegacyFormat::WordPerfect))
            .expect("serialize");
        assert_eq!(json, r#"{"kind":"legacy_format","format":"word_perfect"}"#);
        let back: Category = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Category::LegacyFormat(LegacyFormat::WordPerfect));
    }
}
