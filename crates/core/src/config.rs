//! Immutable run configuration.
//!
//! Parsed options are folded into one [`Config`] value, built once and
//! passed explicitly to every step of the run. Nothing reads mutable
//! globals, so each phase sees exactly the settings the parse produced.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use vmfetch_listing::BuildSelector;
use vmfetch_transfer::{Programs, Protocol, RemoteEndpoint};

/// Name of the hidden staging directory under the destination root.
pub const STAGING_DIR_NAME: &str = ".staging";

/// Name of the run-lock file under the destination root.
pub const LOCK_FILE_NAME: &str = ".vmfetch.lock";

/// Snapshots retained when `--keep` is not given.
const DEFAULT_KEEP: NonZeroUsize = NonZeroUsize::new(7).unwrap();

/// Disk-image flavour to download.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageType {
    /// KVM qcow2 image.
    Kvm,
    /// VMware OVA appliance.
    Vmware,
    /// Hyper-V VHD image.
    Vhd,
}

impl ImageType {
    /// Returns the marker this image type contributes to build-directory
    /// names.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Vmware => "vmware",
            Self::Vhd => "vhd",
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ImageType {
    type Err = ImageTypeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "kvm" => Ok(Self::Kvm),
            "vmware" => Ok(Self::Vmware),
            "vhd" => Ok(Self::Vhd),
            other => Err(ImageTypeParseError {
                value: other.to_string(),
            }),
        }
    }
}

/// Error returned for an unrecognised image type argument.
#[derive(Debug, thiserror::Error)]
#[error("unknown image type '{value}', expected 'kvm', 'vmware', or 'vhd'")]
pub struct ImageTypeParseError {
    value: String,
}

/// Everything one run needs, resolved before the first phase starts.
#[derive(Clone, Debug)]
pub struct Config {
    image: ImageType,
    endpoint: RemoteEndpoint,
    branch: String,
    build_dir: String,
    dest_root: PathBuf,
    source_root: String,
    keep: NonZeroUsize,
    protocol: Option<Protocol>,
    programs: Programs,
    dry_run: bool,
}

impl Config {
    /// Creates a builder for the given image type and remote endpoint.
    #[must_use]
    pub fn builder(image: ImageType, endpoint: RemoteEndpoint) -> ConfigBuilder {
        ConfigBuilder {
            image,
            endpoint,
            branch: "master".to_string(),
            build_dir: "images".to_string(),
            dest_root: PathBuf::from("."),
            source_root: "/srv/builds".to_string(),
            keep: DEFAULT_KEEP,
            protocol: None,
            programs: Programs::new(),
            dry_run: false,
        }
    }

    /// Returns the requested image type.
    #[must_use]
    pub const fn image(&self) -> ImageType {
        self.image
    }

    /// Returns the remote endpoint transfers connect to.
    #[must_use]
    pub const fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Returns the build fork/version selector.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Returns the sub-directory of the selected build to fetch.
    #[must_use]
    pub fn build_dir(&self) -> &str {
        &self.build_dir
    }

    /// Returns the destination root holding the daily snapshots.
    #[must_use]
    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Returns the remote directory holding the build directories.
    #[must_use]
    pub fn source_root(&self) -> &str {
        &self.source_root
    }

    /// Returns the number of snapshots to retain.
    #[must_use]
    pub const fn keep(&self) -> NonZeroUsize {
        self.keep
    }

    /// Returns the explicitly requested protocol, if any.
    #[must_use]
    pub const fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Returns the external program set.
    #[must_use]
    pub const fn programs(&self) -> &Programs {
        &self.programs
    }

    /// Reports whether the run stops after locating the remote build.
    #[must_use]
    pub const fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Returns the hidden staging directory under the destination root.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.dest_root.join(STAGING_DIR_NAME)
    }

    /// Returns the run-lock path under the destination root.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.dest_root.join(LOCK_FILE_NAME)
    }

    /// Returns the selector a matching build-directory name must satisfy.
    #[must_use]
    pub fn build_selector(&self) -> BuildSelector {
        BuildSelector::new([self.branch.as_str(), self.image.token()])
    }
}

/// Builder used to assemble a [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    image: ImageType,
    endpoint: RemoteEndpoint,
    branch: String,
    build_dir: String,
    dest_root: PathBuf,
    source_root: String,
    keep: NonZeroUsize,
    protocol: Option<Protocol>,
    programs: Programs,
    dry_run: bool,
}

impl ConfigBuilder {
    /// Sets the build fork/version selector.
    #[must_use]
    pub fn branch<S: Into<String>>(mut self, branch: S) -> Self {
        self.branch = branch.into();
        self
    }

    /// Sets the build sub-directory to fetch.
    #[must_use]
    pub fn build_dir<S: Into<String>>(mut self, build_dir: S) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    /// Sets the destination root.
    #[must_use]
    pub fn dest_root<P: Into<PathBuf>>(mut self, dest_root: P) -> Self {
        self.dest_root = dest_root.into();
        self
    }

    /// Sets the remote source directory.
    #[must_use]
    pub fn source_root<S: Into<String>>(mut self, source_root: S) -> Self {
        self.source_root = source_root.into();
        self
    }

    /// Sets the number of snapshots to retain.
    #[must_use]
    pub const fn keep(mut self, keep: NonZeroUsize) -> Self {
        self.keep = keep;
        self
    }

    /// Forces a transfer protocol instead of automatic selection.
    #[must_use]
    pub const fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Overrides the external program set.
    #[must_use]
    pub fn programs(mut self, programs: Programs) -> Self {
        self.programs = programs;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Finalises the builder.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            image: self.image,
            endpoint: self.endpoint,
            branch: self.branch,
            build_dir: self.build_dir,
            dest_root: self.dest_root,
            source_root: self.source_root,
            keep: self.keep,
            protocol: self.protocol,
            programs: self.programs,
            dry_run: self.dry_run,
        }
    }
}
