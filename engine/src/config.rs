//! Migration configuration.
//!
//! Loaded from a TOML file; every key is optional and falls back to the
//! built-in default. Paths are validated once, before any work starts.
//!
//! ```toml
//! source_paths = ["/home/me/Documents", "/home/me/Pictures"]
//! destination_path = "/mnt/archive"
//! file_extensions = []          # empty = everything
//! exclude_extensions = ["exe", "msi", "dll", "sys", "bat", "cmd", "tmp", "log"]
//! exclude_dirs = ["windows", "program files", "system32", "temp", "cache"]
//! max_file_size_gb = 10.0
//! batch_size = 100
//! verify_copies = true
//! create_date_folders = false
//! concurrency = 6
//! retry_limit = 3
//! timestamp_tolerance_seconds = 2
//! hash_algorithm = "blake3"
//!
//! [size_limits_mb]              # optional, per category
//! document = 50
//! legacy = 25
//! image = 25
//! video = 500
//! audio = 50
//! unknown = 10
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, EngineResult};
use crate::fs_ops::DiscoveryFilter;
use crate::model::Category;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Executables, system libraries, scripts, temp files and logs.
pub const DEFAULT_EXCLUDE_EXTENSIONS: [&str; 8] =
    ["exe", "msi", "dll", "sys", "bat", "cmd", "tmp", "log"];

/// Operating-system and scratch directories.
pub const DEFAULT_EXCLUDE_DIRS: [&str; 5] =
    ["windows", "program files", "system32", "temp", "cache"];

/// Failure to load a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Everything a plan/execute/verify run is parameterised by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Source roots to migrate
    pub source_paths: Vec<PathBuf>,
    pub destination_path: PathBuf,
    /// Extension allow-list, with or without the dot; empty = all
    pub file_extensions: Vec<String>,
    pub exclude_extensions: Vec<String>,
    /// Directory names pruned during discovery
    pub exclude_dirs: Vec<String>,
    pub max_file_size_gb: f64,
    /// Per-category caps in MiB, keyed by `document`, `image`, `video`,
    /// `audio`, `archive`, `legacy` or `unknown`; applied after classification
    pub size_limits_mb: BTreeMap<String, f64>,
    pub batch_size: usize,
    pub verify_copies: bool,
    pub create_date_folders: bool,
    pub concurrency: usize,
    /// Retries after the first attempt
    pub retry_limit: u32,
    /// Base delay of the exponential retry backoff
    pub retry_backoff_ms: u64,
    /// Per-attempt copy timeout; 0 disables it
    pub copy_timeout_seconds: u64,
    pub timestamp_tolerance_seconds: u64,
    pub hash_algorithm: ChecksumAlgorithm,
    /// Defaults to `<destination>/.carryover/manifest.jsonl`
    pub manifest_path: Option<PathBuf>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            source_paths: Vec::new(),
            destination_path: PathBuf::new(),
            file_extensions: Vec::new(),
            exclude_extensions: DEFAULT_EXCLUDE_EXTENSIONS
                .into_iter()
                .map(String::from)
                .collect(),
            exclude_dirs: DEFAULT_EXCLUDE_DIRS.into_iter().map(String::from).collect(),
            max_file_size_gb: 10.0,
            size_limits_mb: BTreeMap::new(),
            batch_size: 100,
            verify_copies: true,
            create_date_folders: false,
            concurrency: default_concurrency(),
            retry_limit: 3,
            retry_backoff_ms: 250,
            copy_timeout_seconds: 0,
            timestamp_tolerance_seconds: 2,
            hash_algorithm: ChecksumAlgorithm::default(),
            manifest_path: None,
        }
    }
}

/// Available parallelism, clamped to 4..=8.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(4, 8)
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

impl MigrationConfig {
    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Reject configurations no run could start with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.source_paths.is_empty() {
            return Err(EngineError::invalid_config(
                "source_paths",
                "at least one source root is required",
            ));
        }
        for root in &self.source_paths {
            let metadata = fs::metadata(root).map_err(|_| EngineError::SourceNotFound {
                path: root.clone(),
            })?;
            if !metadata.is_dir() {
                return Err(EngineError::SourceNotDirectory { path: root.clone() });
            }
        }

        if self.destination_path.as_os_str().is_empty() {
            return Err(EngineError::invalid_config(
                "destination_path",
                "a destination is required",
            ));
        }
        if self.batch_size == 0 {
            return Err(EngineError::invalid_config("batch_size", "must be positive"));
        }
        if self.concurrency == 0 {
            return Err(EngineError::invalid_config("concurrency", "must be positive"));
        }
        if !(self.max_file_size_gb > 0.0) {
            return Err(EngineError::invalid_config(
                "max_file_size_gb",
                format!("must be positive, got {}", self.max_file_size_gb),
            ));
        }

        for (key, limit) in &self.size_limits_mb {
            if !Category::LIMIT_KEYS.contains(&key.as_str()) {
                return Err(EngineError::invalid_config(
                    "size_limits_mb",
                    format!(
                        "unknown category '{}'; expected one of {}",
                        key,
                        Category::LIMIT_KEYS.join(", ")
                    ),
                ));
            }
            if !(*limit > 0.0) {
                return Err(EngineError::invalid_config(
                    "size_limits_mb",
                    format!("limit for {} must be positive, got {}", key, limit),
                ));
            }
        }

        let destination = absolute(&self.destination_path);
        for root in &self.source_paths {
            if destination.starts_with(absolute(root)) {
                return Err(EngineError::invalid_config(
                    "destination_path",
                    format!(
                        "{} is inside source root {}",
                        self.destination_path.display(),
                        root.display()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        (self.max_file_size_gb * BYTES_PER_GB) as u64
    }

    /// Per-category caps in bytes, keyed by [`Category::limit_key`].
    pub fn category_size_limits(&self) -> BTreeMap<String, u64> {
        self.size_limits_mb
            .iter()
            .map(|(key, mb)| (key.clone(), (mb * BYTES_PER_MB) as u64))
            .collect()
    }

    /// `retry_limit` retries plus the first attempt.
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn copy_timeout(&self) -> Option<Duration> {
        (self.copy_timeout_seconds > 0).then(|| Duration::from_secs(self.copy_timeout_seconds))
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_secs(self.timestamp_tolerance_seconds)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path.clone().unwrap_or_else(|| {
            self.destination_path
                .join(".carryover")
                .join("manifest.jsonl")
        })
    }

    pub fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter {
            extensions: normalize_extensions(&self.file_extensions),
            exclude_extensions: normalize_extensions(&self.exclude_extensions),
            exclude_dirs: self.exclude_dirs.clone(),
            max_file_size: self.max_file_size_bytes(),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    })
}
