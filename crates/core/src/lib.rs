#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_core` ties the leaf crates together into one sequential run:
//! check the environment, take the run lock, pick a transfer protocol,
//! locate the newest matching remote build, transfer it into the hidden
//! staging area, promote staging into the daily snapshot directory, and
//! evict snapshots beyond the retention bound.
//!
//! # Design
//!
//! - [`Config`] is built once from parsed options and passed by reference to
//!   every step; nothing in the run mutates shared state.
//! - [`run`] executes the phases in order and stops at the first
//!   unrecoverable error. Eviction is the one deliberately soft phase: by
//!   then the new snapshot exists, so its failures are logged and reported
//!   but never fail the run.
//! - [`RunError::exit_code`] centralises the mapping from failures to
//!   process exit codes: `1` for usage, environment, and remote-lookup
//!   errors, and the child's own code for transfer failures.

/// Immutable run configuration.
pub mod config;
/// Run-level error taxonomy and exit-code mapping.
pub mod error;
/// Re-entrancy guard over the destination root.
pub mod lock;
/// The sequential run itself.
pub mod run;

pub use config::{Config, ConfigBuilder, ImageType, ImageTypeParseError};
pub use error::RunError;
pub use lock::RunLock;
pub use run::{run, RunSummary};
