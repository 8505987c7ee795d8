//! Re-entrancy guard over the destination root.
//!
//! A manual run overlapping a scheduled one would race on the staging area
//! and could promote a half-synchronised tree. The lock file prevents that:
//! it is created exclusively before any remote activity and removed when
//! the run ends. The owning PID is written into the file so a lock left
//! behind by a crash can be audited before it is removed by hand.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::RunError;

/// Holds the run lock for the duration of a run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquires the lock at `path`, failing when it is already held.
    pub fn acquire(path: &Path) -> Result<Self, RunError> {
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path);
        let mut file = match result {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                return Err(RunError::LockHeld {
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(RunError::Lock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if let Err(source) = writeln!(file, "{}", std::process::id()) {
            let _ = std::fs::remove_file(path);
            return Err(RunError::Lock {
                path: path.to_path_buf(),
                source,
            });
        }

        debug!(path = %path.display(), "acquired run lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %error, "failed to remove run lock");
        }
    }
}
