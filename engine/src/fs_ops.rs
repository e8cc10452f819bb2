//! Filesystem operations.
//!
//! This module provides the low-level operations the pipeline is built on:
//! - Discovering files under a source root, with inclusion filters
//! - Copying a file while hashing it in the same pass
//! - Removing copied files and the empty directories they leave behind
//!
//! Copies go through the [`Copier`] trait so tests can inject failures.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checksums::{ChecksumAlgorithm, ChecksumValue, ContentHasher, BUFFER_SIZE};
use crate::classify::extension_of;
use crate::error::{CopyError, EngineError, EngineResult};
use crate::model::{Category, SkipReason, SkipRecord};

/// Suffix of the temporary file a copy is written to before it is renamed.
pub const PARTIAL_SUFFIX: &str = "carryover-part";

/// Inclusion rules applied while walking a source root.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Lower-case extensions without the dot; empty admits everything
    pub extensions: Vec<String>,
    pub exclude_extensions: Vec<String>,
    /// Directory names pruned from the walk (case-insensitive)
    pub exclude_dirs: Vec<String>,
    /// Files larger than this are recorded as skipped
    pub max_file_size: u64,
}

impl DiscoveryFilter {
    fn admits_extension(&self, path: &Path) -> bool {
        let extension = extension_of(path).unwrap_or_default();
        if self.exclude_extensions.iter().any(|e| *e == extension) {
            return false;
        }
        self.extensions.is_empty() || self.extensions.iter().any(|e| *e == extension)
    }

    fn excludes_dir(&self, name: &str) -> bool {
        self.exclude_dirs
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(name))
    }
}

/// A regular file found under a source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub root: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Everything one walk produced.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub files: Vec<DiscoveredFile>,
    pub skipped: Vec<SkipRecord>,
}

/// Walk a source root, applying the filter.
///
/// Symlinks to files are followed and copied as the file they point at.
/// Symlinks to directories are not descended into; each one is recorded as a
/// skip so the tree below it is never silently missing.
///
/// # Arguments
/// * `root` - Directory to walk
/// * `filter` - Extension, directory and size rules
///
/// # Returns
/// The admitted files in file-name order, plus a skip record for every
/// entry that was oversized, unreadable or a linked directory
///
/// # Errors
/// Only a missing or unreadable root is an error; entries that cannot be read
/// further down are returned as skips.
pub fn discover_files(root: &Path, filter: &DiscoveryFilter) -> EngineResult<Discovery> {
    let metadata = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => EngineError::SourceNotFound {
            path: root.to_path_buf(),
        },
        _ => EngineError::SourceAccessDenied {
            path: root.to_path_buf(),
            source: e,
        },
    })?;
    if !metadata.is_dir() {
        return Err(EngineError::SourceNotDirectory {
            path: root.to_path_buf(),
        });
    }

    let mut discovery = Discovery::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !filter.excludes_dir(&entry.file_name().to_string_lossy())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(EngineError::EnumerationFailed {
                    path: root.to_path_buf(),
                    source: err,
                })
            }
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                discovery.skipped.push(SkipRecord {
                    path,
                    category: Category::Unknown,
                    reason: SkipReason::Unreadable {
                        message: err.to_string(),
                    },
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }
        let is_link = entry.path_is_symlink();
        if !is_link && (!entry.file_type().is_file() || !filter.admits_extension(entry.path())) {
            continue;
        }

        let metadata = if is_link {
            fs::metadata(entry.path()).map_err(|e| e.to_string())
        } else {
            entry.metadata().map_err(|e| e.to_string())
        };
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(message) => {
                warn!(path = %entry.path().display(), error = %message, "skipping unreadable file");
                discovery.skipped.push(SkipRecord {
                    path: entry.path().to_path_buf(),
                    category: Category::Unknown,
                    reason: SkipReason::Unreadable { message },
                });
                continue;
            }
        };

        if is_link {
            if metadata.is_dir() {
                if !filter.excludes_dir(&entry.file_name().to_string_lossy()) {
                    debug!(path = %entry.path().display(), "symlinked directory not followed");
                    discovery.skipped.push(SkipRecord {
                        path: entry.path().to_path_buf(),
                        category: Category::Unknown,
                        reason: SkipReason::LinkedDirectory,
                    });
                }
                continue;
            }
            if !metadata.is_file() || !filter.admits_extension(entry.path()) {
                continue;
            }
        }

        if metadata.len() > filter.max_file_size {
            debug!(path = %entry.path().display(), size = metadata.len(), "oversized");
            discovery.skipped.push(SkipRecord {
                path: entry.path().to_path_buf(),
                category: Category::Unknown,
                reason: SkipReason::Oversized {
                    size: metadata.len(),
                    limit: filter.max_file_size,
                },
            });
            continue;
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        discovery.files.push(DiscoveredFile {
            path: entry.path().to_path_buf(),
            root: root.to_path_buf(),
            size: metadata.len(),
            modified,
        });
    }

    Ok(discovery)
}

/// One copy attempt.
#[derive(Debug, Clone, Copy)]
pub struct CopyRequest<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    pub algorithm: ChecksumAlgorithm,
    /// The attempt fails with a timeout once this instant passes
    pub deadline: Option<Instant>,
}

/// What a successful copy measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    pub hash: ChecksumValue,
    /// Source mtime when the copy started; also set on the destination
    pub source_modified: DateTime<Utc>,
}

/// Performs one copy attempt.
pub trait Copier: Send + Sync {
    fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError>;
}

/// Copies through the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCopier;

impl Copier for FsCopier {
    fn copy(&self, request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError> {
        copy_with_hash(request)
    }
}

/// Path of the temporary file a copy to `destination` is written to.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Copy a file, hashing the bytes as they are written.
///
/// The data lands in a partial file that is synced, stamped with the source
/// mtime and then renamed over `destination`. A failed attempt removes the
/// partial file, so the destination is either absent or complete.
///
/// # Arguments
/// * `request` - Source, destination, hash algorithm and optional deadline
///
/// # Returns
/// Bytes written, their content hash and the source mtime that was applied
///
/// # Errors
/// A [`CopyError`] whose kind tells a source read failure from a destination
/// write failure. The deadline is checked after each chunk, so a timeout is
/// reported at the first chunk boundary past it.
pub fn copy_with_hash(request: &CopyRequest<'_>) -> Result<CopyOutcome, CopyError> {
    let source = request.source;
    let destination = request.destination;

    let mut src_file =
        File::open(source).map_err(|e| CopyError::source_unreadable(source, e))?;
    let src_mtime = src_file
        .metadata()
        .and_then(|m| m.modified())
        .map_err(|e| CopyError::source_unreadable(source, e))?;

    ensure_parent_dir_exists(destination).map_err(|e| CopyError::destination(destination, e))?;

    let partial = partial_path(destination);
    let result = write_partial(&mut src_file, &partial, request);
    let result = result.and_then(|(bytes, hash)| {
        filetime::set_file_mtime(&partial, filetime::FileTime::from_system_time(src_mtime))
            .and_then(|_| fs::rename(&partial, destination))
            .map_err(|e| CopyError::destination(destination, e))?;
        Ok((bytes, hash))
    });

    match result {
        Ok((bytes, hash)) => Ok(CopyOutcome {
            bytes,
            hash,
            source_modified: DateTime::<Utc>::from(src_mtime),
        }),
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %cleanup, "could not remove partial copy");
                }
            }
            Err(err)
        }
    }
}

fn write_partial(
    src_file: &mut File,
    partial: &Path,
    request: &CopyRequest<'_>,
) -> Result<(u64, ChecksumValue), CopyError> {
    let mut dst_file =
        File::create(partial).map_err(|e| CopyError::destination(request.destination, e))?;
    let mut hasher = ContentHasher::new(request.algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = match src_file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::source_unreadable(request.source, e)),
        };
        hasher.update(&buffer[..n]);
        dst_file
            .write_all(&buffer[..n])
            .map_err(|e| CopyError::destination(request.destination, e))?;
        bytes += n as u64;

        if request.deadline.map_or(false, |deadline| Instant::now() > deadline) {
            return Err(CopyError::timeout(request.destination));
        }
    }

    dst_file
        .sync_all()
        .map_err(|e| CopyError::destination(request.destination, e))?;
    Ok((bytes, hasher.finalize()))
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => match fs::metadata(parent) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent path exists but is not a directory",
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
            Err(e) => Err(e),
        },
        _ => Ok(()),
    }
}

/// Create the destination root if needed and check it is a directory.
///
/// # Errors
/// [`EngineError::DestinationAccessDenied`] when the root cannot be created
/// or something other than a directory already sits there
pub fn ensure_destination_root(path: &Path) -> EngineResult<()> {
    let denied = |source| EngineError::DestinationAccessDenied {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(path).map_err(denied)?;
    let metadata = fs::metadata(path).map_err(denied)?;
    if !metadata.is_dir() {
        return Err(denied(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination exists but is not a directory",
        )));
    }
    Ok(())
}

/// Remove a copied file, then prune empty parents up to (not including) `root`.
///
/// # Arguments
/// * `path` - The copied file
/// * `root` - Destination root; pruning stops below it
///
/// # Returns
/// Whether the file existed. A file that is already gone is not an error.
///
/// # Errors
/// Any failure to delete the file itself; failures to prune are ignored
pub fn remove_destination(path: &Path, root: &Path) -> io::Result<bool> {
    let existed = match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };
    prune_empty_parents(path, root);
    Ok(existed)
}

fn prune_empty_parents(path: &Path, root: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // remove_dir refuses non-empty directories
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

/// Current size and mtime of a file.
pub fn stat(path: &Path) -> io::Result<(u64, DateTime<Utc>)> {
    let metadata = fs::metadata(path)?;
    Ok((metadata.len(), DateTime::<Utc>::from(metadata.modified()?)))
}
