#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_promote` moves a freshly synchronised staging tree into the
//! daily snapshot directory. The destination image file may be memory-mapped
//! by a running virtual machine, so promotion must never clobber live state:
//! a file is copied only when the destination is missing or strictly older
//! than the staged source. That rule is the safety contract of the whole
//! tool, not a transfer optimisation.
//!
//! # Design
//!
//! - [`promote`] walks the staging tree in deterministic order, creates
//!   directories as needed, and copies eligible files with their source
//!   modification times preserved. Preserved times are what let a re-run
//!   recognise unchanged content and leave it alone.
//! - After copying, a permission pass adds `rwx` for owner and group on the
//!   promoted directories, `rw` on files, and `rwx` on installer scripts
//!   (names ending in `.sh`). Bits are added to the existing mode; bits for
//!   other users are left as the transfer created them.
//! - Symbolic links and other special entries in staging are skipped with a
//!   debug line. Build trees hold image files and install scripts; anything
//!   else is noise from the transfer tool.
//!
//! # Invariants
//!
//! - A destination file with a modification time strictly newer than its
//!   staged counterpart is never written to.
//! - Promoting the same staging tree twice produces the same destination
//!   tree as promoting it once.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;
use vmfetch_walk::{WalkError, Walker};

/// Mode bits added to promoted directories and installer scripts.
#[cfg(unix)]
const MODE_DIR: u32 = 0o770;
/// Mode bits added to promoted regular files.
#[cfg(unix)]
const MODE_FILE: u32 = 0o660;

/// Reports whether a file name marks an installer script.
#[must_use]
pub fn is_installer_script(name: &str) -> bool {
    name.ends_with(".sh")
}

/// Outcome of one promotion pass.
#[derive(Debug, Default)]
pub struct PromotionReport {
    copied: Vec<PathBuf>,
    skipped: Vec<PathBuf>,
    directories: usize,
}

impl PromotionReport {
    /// Returns the relative paths of the files that were copied.
    #[must_use]
    pub fn copied(&self) -> &[PathBuf] {
        &self.copied
    }

    /// Returns the relative paths of the files left untouched.
    #[must_use]
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// Returns the number of directories visited under the staging root.
    #[must_use]
    pub const fn directories(&self) -> usize {
        self.directories
    }
}

/// Copies the staging tree into `target` without overwriting newer files.
///
/// The target directory is created when missing. After the copy pass every
/// promoted path receives the owner/group permission bits described in the
/// crate documentation.
pub fn promote(staging: &Path, target: &Path) -> Result<PromotionReport, PromoteError> {
    fs::create_dir_all(target)
        .map_err(|error| PromoteError::create_dir(target.to_path_buf(), error))?;

    let mut report = PromotionReport::default();
    let mut promoted = Vec::new();

    for entry in Walker::new(staging).map_err(PromoteError::walk)? {
        let entry = entry.map_err(PromoteError::walk)?;
        let relative = entry.relative_path().to_path_buf();
        let destination = target.join(&relative);

        if entry.is_dir() {
            if !destination.is_dir() {
                fs::create_dir_all(&destination)
                    .map_err(|error| PromoteError::create_dir(destination.clone(), error))?;
            }
            report.directories += 1;
            promoted.push(destination);
            continue;
        }
        if !entry.is_file() {
            debug!(path = %relative.display(), "skipping special staging entry");
            continue;
        }

        let source_mtime = FileTime::from_last_modification_time(entry.metadata());
        if destination_is_current(&destination, source_mtime)? {
            report.skipped.push(relative);
            promoted.push(destination);
            continue;
        }

        fs::copy(entry.full_path(), &destination).map_err(|error| {
            PromoteError::copy(entry.full_path().to_path_buf(), destination.clone(), error)
        })?;
        filetime::set_file_mtime(&destination, source_mtime)
            .map_err(|error| PromoteError::set_times(destination.clone(), error))?;
        debug!(path = %relative.display(), "promoted file");
        report.copied.push(relative);
        promoted.push(destination);
    }

    apply_permissions(target, &promoted)?;
    Ok(report)
}

/// Reports whether the destination already carries this content or newer.
///
/// A missing destination needs the copy; an existing one is current when its
/// modification time is equal to or newer than the staged source.
fn destination_is_current(
    destination: &Path,
    source_mtime: FileTime,
) -> Result<bool, PromoteError> {
    match fs::symlink_metadata(destination) {
        Ok(metadata) => {
            let destination_mtime = FileTime::from_last_modification_time(&metadata);
            Ok(destination_mtime >= source_mtime)
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(PromoteError::inspect(destination.to_path_buf(), error)),
    }
}

#[cfg(unix)]
fn apply_permissions(target: &Path, promoted: &[PathBuf]) -> Result<(), PromoteError> {
    use std::os::unix::fs::PermissionsExt;

    let add_bits = |path: &Path| -> Result<(), PromoteError> {
        let metadata = fs::symlink_metadata(path)
            .map_err(|error| PromoteError::inspect(path.to_path_buf(), error))?;
        let bits = if metadata.is_dir() {
            MODE_DIR
        } else if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_installer_script)
        {
            MODE_DIR
        } else {
            MODE_FILE
        };

        let mut permissions = metadata.permissions();
        let mode = permissions.mode();
        if mode & bits != bits {
            permissions.set_mode(mode | bits);
            fs::set_permissions(path, permissions)
                .map_err(|error| PromoteError::set_permissions(path.to_path_buf(), error))?;
        }
        Ok(())
    };

    add_bits(target)?;
    for path in promoted {
        add_bits(path)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_permissions(_target: &Path, _promoted: &[PathBuf]) -> Result<(), PromoteError> {
    Ok(())
}

/// Error returned when promotion fails.
#[derive(Debug)]
pub struct PromoteError {
    kind: PromoteErrorKind,
}

impl PromoteError {
    fn walk(source: WalkError) -> Self {
        Self {
            kind: PromoteErrorKind::Walk { source },
        }
    }

    fn create_dir(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: PromoteErrorKind::CreateDir { path, source },
        }
    }

    fn copy(from: PathBuf, to: PathBuf, source: io::Error) -> Self {
        Self {
            kind: PromoteErrorKind::Copy { from, to, source },
        }
    }

    fn inspect(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: PromoteErrorKind::Inspect { path, source },
        }
    }

    fn set_times(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: PromoteErrorKind::SetTimes { path, source },
        }
    }

    fn set_permissions(path: PathBuf, source: io::Error) -> Self {
        Self {
            kind: PromoteErrorKind::SetPermissions { path, source },
        }
    }

    /// Returns the specific failure that aborted promotion.
    #[must_use]
    pub const fn kind(&self) -> &PromoteErrorKind {
        &self.kind
    }
}

impl fmt::Display for PromoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PromoteErrorKind::Walk { source } => {
                write!(f, "failed to walk staging tree: {source}")
            }
            PromoteErrorKind::CreateDir { path, source } => {
                write!(f, "failed to create '{}': {}", path.display(), source)
            }
            PromoteErrorKind::Copy { from, to, source } => {
                write!(
                    f,
                    "failed to copy '{}' to '{}': {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
            PromoteErrorKind::Inspect { path, source } => {
                write!(f, "failed to inspect '{}': {}", path.display(), source)
            }
            PromoteErrorKind::SetTimes { path, source } => {
                write!(
                    f,
                    "failed to set modification time on '{}': {}",
                    path.display(),
                    source
                )
            }
            PromoteErrorKind::SetPermissions { path, source } => {
                write!(
                    f,
                    "failed to set permissions on '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl Error for PromoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            PromoteErrorKind::Walk { source } => Some(source),
            PromoteErrorKind::CreateDir { source, .. }
            | PromoteErrorKind::Copy { source, .. }
            | PromoteErrorKind::Inspect { source, .. }
            | PromoteErrorKind::SetTimes { source, .. }
            | PromoteErrorKind::SetPermissions { source, .. } => Some(source),
        }
    }
}

/// Classification of promotion failures.
#[derive(Debug)]
pub enum PromoteErrorKind {
    /// The staging tree could not be traversed.
    Walk {
        /// Traversal failure reported by the walker.
        source: WalkError,
    },
    /// A destination directory could not be created.
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// A file copy failed.
    Copy {
        /// Staged source file.
        from: PathBuf,
        /// Destination path of the failed copy.
        to: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// Destination metadata could not be read.
    Inspect {
        /// Path whose metadata query failed.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// The copied file's modification time could not be set.
    SetTimes {
        /// Destination file whose timestamp update failed.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// The permission pass failed on a promoted path.
    SetPermissions {
        /// Path whose permission update failed.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
}
