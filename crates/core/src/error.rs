//! Run-level error taxonomy.
//!
//! Every unrecoverable failure in a run is folded into [`RunError`], and
//! [`RunError::exit_code`] is the single place where failures become process
//! exit codes: `1` for usage, environment, and remote-lookup errors, the
//! child's own code for transfer failures.

use std::io;
use std::path::PathBuf;

use vmfetch_listing::ListingError;
use vmfetch_promote::PromoteError;
use vmfetch_transfer::TransferError;

/// Unrecoverable failure during a fetch run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The destination root does not exist or is not a directory.
    #[error("destination directory '{}' does not exist", path.display())]
    MissingDestination {
        /// The configured destination root.
        path: PathBuf,
    },

    /// Another run holds the lock over the destination root.
    #[error("another run holds the lock '{}'; remove it if no run is active", path.display())]
    LockHeld {
        /// Path of the held lock file.
        path: PathBuf,
    },

    /// The lock file could not be created for a reason other than being held.
    #[error("failed to create run lock '{}': {source}", path.display())]
    Lock {
        /// Path of the lock file.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },

    /// The staging area could not be created.
    #[error("failed to create staging directory '{}': {source}", path.display())]
    StagingCreate {
        /// Path of the staging directory.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },

    /// The remote listing subprocess failed.
    #[error("remote listing failed: {source}")]
    Listing {
        /// Failure reported by the listing subprocess.
        source: TransferError,
    },

    /// The remote listing output could not be parsed.
    #[error("remote listing is malformed: {source}")]
    ListingParse {
        /// Parse failure with the offending line.
        source: ListingError,
    },

    /// No remote build directory matched the requested branch and image.
    #[error("no build matching '{selector}' under '{source_root}'")]
    NoMatchingBuild {
        /// Tokens the build name was required to contain.
        selector: String,
        /// Remote directory that was listed.
        source_root: String,
    },

    /// The transfer subprocess exited with a non-zero status.
    #[error("transfer failed: {source}")]
    Transfer {
        /// Failure reported by the transfer subprocess.
        source: TransferError,
    },

    /// Promotion into the daily snapshot directory failed.
    #[error("promotion failed: {source}")]
    Promotion {
        /// Failure reported by the promotion step.
        source: PromoteError,
    },
}

impl RunError {
    /// Returns the process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Transfer { source } => source.exit_code(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_transfer_errors_exit_with_one() {
        let error = RunError::MissingDestination {
            path: PathBuf::from("/var/images"),
        };
        assert_eq!(error.exit_code(), 1);

        let error = RunError::NoMatchingBuild {
            selector: "master+kvm".to_string(),
            source_root: "/srv/builds".to_string(),
        };
        assert_eq!(error.exit_code(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn transfer_errors_forward_the_child_code() {
        use std::process::Command;

        let mut command = Command::new("sh");
        command.args(["-c", "exit 9"]);
        let source = vmfetch_transfer::run(command, None).expect_err("non-zero exit");
        let error = RunError::Transfer { source };
        assert_eq!(error.exit_code(), 9);
    }
}
