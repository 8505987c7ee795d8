#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_retention` keeps the destination root at a bounded number of
//! daily snapshot directories. The policy re-derives its state from the
//! filesystem on every run: the root is scanned into an mtime-ordered list
//! of [`Snapshot`] entries, [`evict`] computes the oldest surplus, and
//! [`apply`] deletes those directories.
//!
//! # Design
//!
//! - [`evict`] is a pure function over an ascending-sorted slice so the
//!   policy invariants can be tested without touching a filesystem.
//! - Deletion goes through the [`Deleter`] trait. The default [`FsDeleter`]
//!   tries an unprivileged recursive delete first and escalates once to a
//!   privileged `rm -rf` when the unprivileged attempt is denied; snapshot
//!   trees can contain root-owned files written by a formerly privileged
//!   run.
//! - Deletion failures are warnings, not errors. By the time eviction runs
//!   the new snapshot has already been promoted, and a lingering old
//!   directory must not turn the run into a failure.
//!
//! # Invariants
//!
//! - After a successful [`apply`], at most `max_snapshots` snapshot
//!   directories remain and they are exactly the most recently modified
//!   ones.
//! - Hidden directories (the staging area among them) are never scanned,
//!   never counted, never deleted.
//! - Ties in modification time keep scan order, which is itself name-sorted
//!   and therefore deterministic.

use std::error::Error;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

/// One daily snapshot directory under the destination root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    path: PathBuf,
    modified: std::time::SystemTime,
}

impl Snapshot {
    /// Creates a snapshot record from a path and its modification time.
    #[must_use]
    pub const fn new(path: PathBuf, modified: std::time::SystemTime) -> Self {
        Self { path, modified }
    }

    /// Returns the snapshot directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the directory's modification time.
    #[must_use]
    pub const fn modified(&self) -> std::time::SystemTime {
        self.modified
    }
}

/// Bound on the number of snapshots retained after a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetentionConfig {
    max_snapshots: NonZeroUsize,
}

impl RetentionConfig {
    /// Creates a retention bound keeping `max_snapshots` directories.
    #[must_use]
    pub const fn new(max_snapshots: NonZeroUsize) -> Self {
        Self { max_snapshots }
    }

    /// Returns the number of snapshots a run leaves behind.
    #[must_use]
    pub const fn max_snapshots(&self) -> NonZeroUsize {
        self.max_snapshots
    }
}

/// Scans the destination root into an mtime-ascending snapshot list.
///
/// Only immediate subdirectories count; hidden names (leading `.`) and
/// non-directories are skipped. Entries are sorted by name first so that
/// modification-time ties resolve the same way on every platform.
pub fn scan(root: &Path) -> Result<Vec<Snapshot>, RetentionError> {
    let mut snapshots = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|error| RetentionError::scan_root(root.to_path_buf(), error))?;
    for entry in entries {
        let entry =
            entry.map_err(|error| RetentionError::scan_root(root.to_path_buf(), error))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .map_err(|error| RetentionError::metadata(path.clone(), error))?;
        if !metadata.is_dir() {
            continue;
        }
        let modified = metadata
            .modified()
            .map_err(|error| RetentionError::metadata(path.clone(), error))?;
        snapshots.push(Snapshot::new(path, modified));
    }

    snapshots.sort_by(|a, b| a.path().cmp(b.path()));
    snapshots.sort_by_key(Snapshot::modified);
    Ok(snapshots)
}

/// Computes the snapshots to delete so at most `max` remain.
///
/// `snapshots` must be sorted ascending by modification time; the returned
/// slice is the oldest prefix. An empty slice means nothing is over the
/// bound.
#[must_use]
pub fn evict(snapshots: &[Snapshot], max: NonZeroUsize) -> &[Snapshot] {
    let surplus = snapshots.len().saturating_sub(max.get());
    &snapshots[..surplus]
}

/// Removes snapshot directories chosen by [`evict`].
pub trait Deleter {
    /// Recursively removes `path`.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// Default deleter: unprivileged removal with one privileged escalation.
#[derive(Clone, Debug)]
pub struct FsDeleter {
    privileged_program: OsString,
}

impl FsDeleter {
    /// Creates a deleter escalating through `sudo`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            privileged_program: OsString::from("sudo"),
        }
    }

    /// Overrides the program used for the privileged escalation.
    #[must_use]
    pub fn with_privileged_program<S: Into<OsString>>(mut self, program: S) -> Self {
        self.privileged_program = program.into();
        self
    }

    fn privileged_remove(&self, path: &Path) -> io::Result<()> {
        let status = Command::new(&self.privileged_program)
            .args(["rm", "-rf", "--"])
            .arg(path)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "privileged delete exited with {status}"
            )))
        }
    }
}

impl Default for FsDeleter {
    fn default() -> Self {
        Self::new()
    }
}

impl Deleter for FsDeleter {
    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                debug!(path = %path.display(), "unprivileged delete denied, escalating");
                self.privileged_remove(path)
            }
            Err(error) => Err(error),
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Default)]
pub struct EvictionReport {
    deleted: Vec<PathBuf>,
    failed: Vec<(PathBuf, io::Error)>,
}

impl EvictionReport {
    /// Returns the directories that were removed.
    #[must_use]
    pub fn deleted(&self) -> &[PathBuf] {
        &self.deleted
    }

    /// Returns the directories whose removal failed, with the final error.
    #[must_use]
    pub fn failed(&self) -> &[(PathBuf, io::Error)] {
        &self.failed
    }

    /// Reports whether every chosen victim was removed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Scans `root` and deletes the snapshots exceeding the retention bound.
///
/// Individual deletion failures are logged and collected in the report;
/// they never abort the pass or fail the run.
pub fn apply<D: Deleter>(
    root: &Path,
    config: RetentionConfig,
    deleter: &D,
) -> Result<EvictionReport, RetentionError> {
    let snapshots = scan(root)?;
    let victims = evict(&snapshots, config.max_snapshots());

    let mut report = EvictionReport::default();
    for victim in victims {
        match deleter.remove_dir(victim.path()) {
            Ok(()) => {
                debug!(path = %victim.path().display(), "evicted snapshot");
                report.deleted.push(victim.path().to_path_buf());
            }
            Err(error) => {
                warn!(
                    path = %victim.path().display(),
                    %error,
                    "failed to evict snapshot"
                );
                report.failed.push((victim.path().to_path_buf(), error));
            }
        }
    }
    Ok(report)
}

/// Error returned when the destination root cannot be scanned.
#[derive(Debug)]
pub struct RetentionError {
    kind: RetentionErrorKind,
}

impl RetentionError {
    fn scan_root(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: RetentionErrorKind::ScanRoot { path, source },
        }
    }

    fn metadata(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: RetentionErrorKind::Metadata { path, source },
        }
    }

    /// Returns the specific scan failure.
    #[must_use]
    pub const fn kind(&self) -> &RetentionErrorKind {
        &self.kind
    }
}

impl fmt::Display for RetentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RetentionErrorKind::ScanRoot { path, source } => {
                write!(
                    f,
                    "failed to scan snapshot root '{}': {}",
                    path.display(),
                    source
                )
            }
            RetentionErrorKind::Metadata { path, source } => {
                write!(
                    f,
                    "failed to inspect snapshot '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl Error for RetentionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            RetentionErrorKind::ScanRoot { source, .. }
            | RetentionErrorKind::Metadata { source, .. } => Some(source),
        }
    }
}

/// Classification of scan failures.
#[derive(Debug)]
pub enum RetentionErrorKind {
    /// The destination root could not be read.
    ScanRoot {
        /// Root that failed to enumerate.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// A snapshot directory's metadata could not be read.
    Metadata {
        /// Snapshot path whose metadata query failed.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
}
