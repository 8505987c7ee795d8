//! The sequential fetch run.
//!
//! Phase order is fixed: environment check, lock, SELECT_PROTOCOL,
//! LOCATE_REMOTE_BUILD, TRANSFER, PROMOTE, EVICT_OLD. The first
//! unrecoverable error aborts the run; only eviction failures are soft.

use std::fs;
use std::path::PathBuf;

use time::OffsetDateTime;
use tracing::{debug, info, info_span, warn};

use vmfetch_listing::parse_listing;
use vmfetch_promote::promote;
use vmfetch_retention::{FsDeleter, RetentionConfig};
use vmfetch_transfer::{
    capture, fetch_command, listing_command, run as run_subprocess, Protocol, Secret,
};

use crate::config::Config;
use crate::error::RunError;
use crate::lock::RunLock;

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    build: String,
    protocol: Protocol,
    snapshot_dir: PathBuf,
    copied: usize,
    skipped: usize,
    evicted: usize,
    eviction_failures: usize,
    dry_run: bool,
}

impl RunSummary {
    /// Returns the remote directory the run fetched (or would fetch).
    #[must_use]
    pub fn build(&self) -> &str {
        &self.build
    }

    /// Returns the transfer protocol the run selected.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the daily snapshot directory.
    #[must_use]
    pub fn snapshot_dir(&self) -> &std::path::Path {
        &self.snapshot_dir
    }

    /// Returns the number of files promotion copied.
    #[must_use]
    pub const fn copied(&self) -> usize {
        self.copied
    }

    /// Returns the number of files promotion left untouched.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }

    /// Returns the number of snapshots eviction removed.
    #[must_use]
    pub const fn evicted(&self) -> usize {
        self.evicted
    }

    /// Returns the number of snapshots eviction failed to remove.
    #[must_use]
    pub const fn eviction_failures(&self) -> usize {
        self.eviction_failures
    }

    /// Reports whether the run stopped after locating the remote build.
    #[must_use]
    pub const fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Executes one fetch run against the given configuration.
///
/// `secret` is the remote password; `None` means the transfer tools are
/// expected to authenticate without one (agent, host keys, or a wrapper
/// configured via the program overrides).
pub fn run(config: &Config, secret: Option<&Secret>) -> Result<RunSummary, RunError> {
    if !config.dest_root().is_dir() {
        return Err(RunError::MissingDestination {
            path: config.dest_root().to_path_buf(),
        });
    }

    let _lock = if config.dry_run() {
        None
    } else {
        Some(RunLock::acquire(&config.lock_path())?)
    };

    let protocol = select_protocol(config);
    let build = locate_remote_build(config, secret)?;
    let snapshot_dir = config.dest_root().join(daily_name());

    if config.dry_run() {
        info!(%build, %protocol, "dry run: stopping before transfer");
        return Ok(RunSummary {
            build,
            protocol,
            snapshot_dir,
            copied: 0,
            skipped: 0,
            evicted: 0,
            eviction_failures: 0,
            dry_run: true,
        });
    }

    transfer(config, protocol, &build, secret)?;

    let promotion = {
        let _span = info_span!("promote").entered();
        promote(&config.staging_dir(), &snapshot_dir)
            .map_err(|source| RunError::Promotion { source })?
    };

    let (evicted, eviction_failures) = evict_old(config);

    info!(
        %build,
        %protocol,
        snapshot = %snapshot_dir.display(),
        copied = promotion.copied().len(),
        skipped = promotion.skipped().len(),
        evicted,
        "fetch run complete"
    );
    Ok(RunSummary {
        build,
        protocol,
        snapshot_dir,
        copied: promotion.copied().len(),
        skipped: promotion.skipped().len(),
        evicted,
        eviction_failures,
        dry_run: false,
    })
}

/// Chooses the transfer protocol for this run.
///
/// An explicit `--protocol` wins. Otherwise a populated staging area means a
/// previous run already paid for the full mirror and the cheap incremental
/// path applies; an empty or missing staging area forces the first-time
/// mirror.
#[must_use]
pub fn select_protocol(config: &Config) -> Protocol {
    let _span = info_span!("select_protocol").entered();
    let protocol = config.protocol().unwrap_or_else(|| {
        if staging_is_populated(config) {
            Protocol::Rsync
        } else {
            Protocol::Scp
        }
    });
    debug!(%protocol, explicit = config.protocol().is_some(), "selected transfer protocol");
    protocol
}

fn staging_is_populated(config: &Config) -> bool {
    fs::read_dir(config.staging_dir())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn locate_remote_build(config: &Config, secret: Option<&Secret>) -> Result<String, RunError> {
    let _span = info_span!("locate_remote_build").entered();

    let command = listing_command(config.programs(), config.endpoint(), config.source_root());
    let output = capture(command, secret).map_err(|source| RunError::Listing { source })?;
    let builds = parse_listing(&output).map_err(|source| RunError::ListingParse { source })?;

    let selector = config.build_selector();
    let selected =
        selector
            .select(&builds)
            .ok_or_else(|| RunError::NoMatchingBuild {
                selector: selector.to_string(),
                source_root: config.source_root().to_string(),
            })?;
    debug!(build = %selected.path(), "located remote build");

    let build_dir = config.build_dir();
    if build_dir.is_empty() {
        Ok(selected.path().to_string())
    } else {
        Ok(format!("{}/{}", selected.path(), build_dir))
    }
}

fn transfer(
    config: &Config,
    protocol: Protocol,
    build: &str,
    secret: Option<&Secret>,
) -> Result<(), RunError> {
    let _span = info_span!("transfer", %protocol).entered();

    let staging = config.staging_dir();
    fs::create_dir_all(&staging).map_err(|source| RunError::StagingCreate {
        path: staging.clone(),
        source,
    })?;

    let command = fetch_command(protocol, config.programs(), config.endpoint(), build, &staging);
    run_subprocess(command, secret).map_err(|source| RunError::Transfer { source })
}

fn evict_old(config: &Config) -> (usize, usize) {
    let _span = info_span!("evict_old").entered();

    let retention = RetentionConfig::new(config.keep());
    match vmfetch_retention::apply(config.dest_root(), retention, &FsDeleter::new()) {
        Ok(report) => (report.deleted().len(), report.failed().len()),
        Err(error) => {
            warn!(%error, "snapshot eviction skipped");
            (0, 0)
        }
    }
}

/// Name of today's snapshot directory.
fn daily_name() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageType;
    use vmfetch_transfer::RemoteEndpoint;

    fn config_at(dest: &std::path::Path) -> Config {
        Config::builder(
            ImageType::Kvm,
            RemoteEndpoint::new("builder".into(), "build-host".into()),
        )
        .dest_root(dest)
        .build()
    }

    #[test]
    fn daily_name_is_an_iso_date() {
        let name = daily_name();
        assert_eq!(name.len(), 10);
        let bytes = name.as_bytes();
        assert_eq!(bytes[4], b'-');
        assert_eq!(bytes[7], b'-');
    }

    #[test]
    fn empty_staging_selects_the_first_time_mirror() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        assert_eq!(select_protocol(&config), Protocol::Scp);

        fs::create_dir(config.staging_dir()).expect("staging");
        assert_eq!(select_protocol(&config), Protocol::Scp);
    }

    #[test]
    fn populated_staging_selects_the_incremental_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(temp.path());
        fs::create_dir(config.staging_dir()).expect("staging");
        fs::write(config.staging_dir().join("disk.img"), b"image").expect("payload");
        assert_eq!(select_protocol(&config), Protocol::Rsync);
    }

    #[test]
    fn explicit_protocol_overrides_the_heuristic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = Config::builder(
            ImageType::Kvm,
            RemoteEndpoint::new("builder".into(), "build-host".into()),
        )
        .dest_root(temp.path())
        .protocol(Protocol::Scp)
        .build();
        fs::create_dir(config.staging_dir()).expect("staging");
        fs::write(config.staging_dir().join("disk.img"), b"image").expect("payload");
        assert_eq!(select_protocol(&config), Protocol::Scp);
    }

    #[test]
    fn missing_destination_fails_before_any_remote_activity() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_at(&temp.path().join("absent"));
        let error = run(&config, None).expect_err("missing destination");
        assert!(matches!(error, RunError::MissingDestination { .. }));
        assert_eq!(error.exit_code(), 1);
    }
}
