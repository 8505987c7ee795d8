#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_listing` turns the output of the remote listing command into
//! structured [`RemoteBuild`] records and selects the build directory a run
//! should download. The listing command prints one record per line in the
//! form `<epoch-seconds> <path>` (the `find -printf '%T@ %p\n'` format), so
//! every record carries its own timestamp and no selection decision ever
//! rests on fuzzy text matching.
//!
//! # Design
//!
//! - [`parse_listing`] validates every line; a malformed line fails the whole
//!   parse. A truncated or garbled listing means the remote command went
//!   wrong, and downloading on top of a bad parse risks fetching the wrong
//!   build.
//! - [`BuildSelector`] holds the name tokens a build directory must contain
//!   (the branch and the image-type marker) and picks the most recently
//!   modified match. Ties keep listing order.
//!
//! # Errors
//!
//! [`ListingError`] reports the offending line number and content so the log
//! line identifies the remote record that broke the parse.

use std::error::Error;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One build directory reported by the remote listing command.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteBuild {
    path: String,
    modified: SystemTime,
}

impl RemoteBuild {
    /// Creates a record from an already-parsed path and timestamp.
    #[must_use]
    pub const fn new(path: String, modified: SystemTime) -> Self {
        Self { path, modified }
    }

    /// Returns the full remote path of the build directory.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the final component of the remote path.
    ///
    /// Remote paths are produced by a POSIX `find`, so `/` is the only
    /// separator that can occur.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns the modification time reported for the build directory.
    #[must_use]
    pub const fn modified(&self) -> SystemTime {
        self.modified
    }
}

/// Parses listing output into [`RemoteBuild`] records.
///
/// Blank lines are ignored. Every other line must contain a non-negative
/// timestamp in seconds (fractions allowed), a single space, and a path.
pub fn parse_listing(text: &str) -> Result<Vec<RemoteBuild>, ListingError> {
    let mut builds = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let Some((stamp, path)) = line.split_once(' ') else {
            return Err(ListingError::missing_path(line_number, line));
        };
        if path.is_empty() {
            return Err(ListingError::missing_path(line_number, line));
        }
        let seconds: f64 = stamp
            .parse()
            .map_err(|_| ListingError::invalid_timestamp(line_number, line))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ListingError::invalid_timestamp(line_number, line));
        }
        let modified = UNIX_EPOCH + Duration::from_secs_f64(seconds);
        builds.push(RemoteBuild::new(path.to_string(), modified));
    }
    Ok(builds)
}

/// Name-token filter that picks the build a run should download.
#[derive(Clone, Debug)]
pub struct BuildSelector {
    tokens: Vec<String>,
}

impl BuildSelector {
    /// Creates a selector requiring every token to appear in the build's
    /// directory name.
    #[must_use]
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the tokens a matching build name must contain.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    fn matches(&self, build: &RemoteBuild) -> bool {
        let name = build.file_name();
        self.tokens.iter().all(|token| name.contains(token.as_str()))
    }

    /// Selects the most recently modified matching build.
    ///
    /// When several matches share a modification time the first one in
    /// listing order wins.
    #[must_use]
    pub fn select<'a>(&self, builds: &'a [RemoteBuild]) -> Option<&'a RemoteBuild> {
        let mut best: Option<&RemoteBuild> = None;
        for build in builds.iter().filter(|build| self.matches(build)) {
            match best {
                Some(current) if build.modified() <= current.modified() => {}
                _ => best = Some(build),
            }
        }
        best
    }
}

impl fmt::Display for BuildSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.tokens {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(token)?;
            first = false;
        }
        Ok(())
    }
}

/// Error returned when the remote listing cannot be parsed.
#[derive(Debug)]
pub struct ListingError {
    kind: ListingErrorKind,
    line_number: usize,
    line: String,
}

impl ListingError {
    fn missing_path(line_number: usize, line: &str) -> Self {
        Self {
            kind: ListingErrorKind::MissingPath,
            line_number,
            line: line.to_string(),
        }
    }

    fn invalid_timestamp(line_number: usize, line: &str) -> Self {
        Self {
            kind: ListingErrorKind::InvalidTimestamp,
            line_number,
            line: line.to_string(),
        }
    }

    /// Returns the classification of the parse failure.
    #[must_use]
    pub const fn kind(&self) -> &ListingErrorKind {
        &self.kind
    }

    /// Returns the one-based line number of the offending record.
    #[must_use]
    pub const fn line_number(&self) -> usize {
        self.line_number
    }
}

impl fmt::Display for ListingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ListingErrorKind::MissingPath => write!(
                f,
                "listing line {} has no path component: '{}'",
                self.line_number, self.line
            ),
            ListingErrorKind::InvalidTimestamp => write!(
                f,
                "listing line {} has an invalid timestamp: '{}'",
                self.line_number, self.line
            ),
        }
    }
}

impl Error for ListingError {}

/// Classification of listing parse failures.
#[derive(Debug, Eq, PartialEq)]
pub enum ListingErrorKind {
    /// The line lacked a path after the timestamp field.
    MissingPath,
    /// The timestamp field was not a non-negative number.
    InvalidTimestamp,
}
