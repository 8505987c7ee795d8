#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `vmfetch_walk` provides the deterministic filesystem traversal used when
//! promoting a freshly downloaded staging tree into a daily snapshot
//! directory. The walker enumerates regular files and directories beneath a
//! root in depth-first order, yielding each entry together with the path
//! relative to that root so callers can mirror the tree elsewhere.
//!
//! # Design
//!
//! - [`Walker`] implements [`Iterator`] and yields [`WalkEntry`] values.
//!   Directory contents are sorted lexicographically before being visited, so
//!   the sequence is stable across platforms and filesystem iteration orders.
//! - The root entry itself is not emitted; traversal starts with the root's
//!   children. Promotion always operates on an existing pair of directories,
//!   so the root carries no information.
//! - Symbolic links are yielded as themselves and never followed. A staging
//!   area is populated by `rsync`/`scp` and contains image files and install
//!   scripts; descending through links could escape the staging root.
//!
//! # Invariants
//!
//! - Every yielded [`WalkEntry`] resides within the configured root and its
//!   relative path contains no `..` segments.
//! - A directory is yielded before any of its contents.
//! - Traversal never panics; filesystem failures surface as [`WalkError`].
//!
//! # Examples
//!
//! ```
//! use vmfetch_walk::Walker;
//! use std::fs;
//!
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let temp = tempfile::tempdir()?;
//! fs::create_dir(temp.path().join("sub"))?;
//! fs::write(temp.path().join("sub/disk.img"), b"image")?;
//!
//! let mut relative = Vec::new();
//! for entry in Walker::new(temp.path())? {
//!     relative.push(entry?.relative_path().to_path_buf());
//! }
//! assert_eq!(relative, vec![
//!     std::path::PathBuf::from("sub"),
//!     std::path::PathBuf::from("sub/disk.img"),
//! ]);
//! # Ok(())
//! # }
//! # demo().unwrap();
//! ```

use std::error::Error;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Depth-first iterator over the entries beneath a staging root.
pub struct Walker {
    stack: Vec<PendingDir>,
    finished: bool,
}

impl Walker {
    /// Creates a walker rooted at `root`.
    ///
    /// The root must name an existing directory; its children are yielded in
    /// sorted order, directories before their contents.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, WalkError> {
        let root = root.as_ref().to_path_buf();
        let metadata =
            fs::symlink_metadata(&root).map_err(|error| WalkError::root(root.clone(), error))?;
        if !metadata.is_dir() {
            return Err(WalkError::root(
                root,
                io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }

        let first = PendingDir::read(root, PathBuf::new())?;
        Ok(Self {
            stack: vec![first],
            finished: false,
        })
    }

    fn step(&mut self) -> Result<Option<WalkEntry>, WalkError> {
        loop {
            let (full_path, relative_path) = {
                let Some(dir) = self.stack.last_mut() else {
                    return Ok(None);
                };
                match dir.next_name() {
                    Some(name) => {
                        let full = dir.fs_path.join(&name);
                        let mut relative = dir.relative_prefix.clone();
                        relative.push(&name);
                        (full, relative)
                    }
                    None => {
                        self.stack.pop();
                        continue;
                    }
                }
            };

            let metadata = fs::symlink_metadata(&full_path)
                .map_err(|error| WalkError::metadata(full_path.clone(), error))?;
            if metadata.is_dir() {
                self.stack
                    .push(PendingDir::read(full_path.clone(), relative_path.clone())?);
            }

            return Ok(Some(WalkEntry {
                full_path,
                relative_path,
                metadata,
            }));
        }
    }
}

impl Iterator for Walker {
    type Item = Result<WalkEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(error) => {
                self.finished = true;
                Some(Err(error))
            }
        }
    }
}

struct PendingDir {
    fs_path: PathBuf,
    relative_prefix: PathBuf,
    names: Vec<OsString>,
    index: usize,
}

impl PendingDir {
    fn read(fs_path: PathBuf, relative_prefix: PathBuf) -> Result<Self, WalkError> {
        let mut names = Vec::new();
        let entries =
            fs::read_dir(&fs_path).map_err(|error| WalkError::read_dir(fs_path.clone(), error))?;
        for entry in entries {
            let entry =
                entry.map_err(|error| WalkError::read_dir_entry(fs_path.clone(), error))?;
            names.push(entry.file_name());
        }
        names.sort();

        Ok(Self {
            fs_path,
            relative_prefix,
            names,
            index: 0,
        })
    }

    fn next_name(&mut self) -> Option<OsString> {
        let name = self.names.get(self.index)?.clone();
        self.index += 1;
        Some(name)
    }
}

/// One filesystem entry produced by a [`Walker`].
#[derive(Debug)]
pub struct WalkEntry {
    full_path: PathBuf,
    relative_path: PathBuf,
    metadata: fs::Metadata,
}

impl WalkEntry {
    /// Returns the absolute path of the entry.
    #[must_use]
    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    /// Returns the path relative to the traversal root.
    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Provides the [`fs::Metadata`] captured when the entry was visited.
    #[must_use]
    pub fn metadata(&self) -> &fs::Metadata {
        &self.metadata
    }

    /// Reports whether the entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    /// Reports whether the entry is a regular file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.metadata.is_file()
    }
}

/// Error returned when traversal fails.
#[derive(Debug)]
pub struct WalkError {
    kind: WalkErrorKind,
}

impl WalkError {
    fn new(kind: WalkErrorKind) -> Self {
        Self { kind }
    }

    fn root(path: PathBuf, source: io::Error) -> Self {
        Self::new(WalkErrorKind::Root { path, source })
    }

    fn read_dir(path: PathBuf, source: io::Error) -> Self {
        Self::new(WalkErrorKind::ReadDir { path, source })
    }

    fn read_dir_entry(path: PathBuf, source: io::Error) -> Self {
        Self::new(WalkErrorKind::ReadDirEntry { path, source })
    }

    fn metadata(path: PathBuf, source: io::Error) -> Self {
        Self::new(WalkErrorKind::Metadata { path, source })
    }

    /// Returns the specific failure that terminated traversal.
    #[must_use]
    pub fn kind(&self) -> &WalkErrorKind {
        &self.kind
    }

    /// Returns the filesystem path associated with the failure.
    #[must_use]
    pub fn path(&self) -> &Path {
        match &self.kind {
            WalkErrorKind::Root { path, .. }
            | WalkErrorKind::ReadDir { path, .. }
            | WalkErrorKind::ReadDirEntry { path, .. }
            | WalkErrorKind::Metadata { path, .. } => path,
        }
    }
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WalkErrorKind::Root { path, source } => {
                write!(f, "failed to open walk root '{}': {}", path.display(), source)
            }
            WalkErrorKind::ReadDir { path, source } => {
                write!(f, "failed to read directory '{}': {}", path.display(), source)
            }
            WalkErrorKind::ReadDirEntry { path, source } => {
                write!(f, "failed to read entry in '{}': {}", path.display(), source)
            }
            WalkErrorKind::Metadata { path, source } => {
                write!(
                    f,
                    "failed to inspect metadata for '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl Error for WalkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            WalkErrorKind::Root { source, .. }
            | WalkErrorKind::ReadDir { source, .. }
            | WalkErrorKind::ReadDirEntry { source, .. }
            | WalkErrorKind::Metadata { source, .. } => Some(source),
        }
    }
}

/// Classification of traversal failures.
#[derive(Debug)]
pub enum WalkErrorKind {
    /// The traversal root is missing or is not a directory.
    Root {
        /// Root path that could not be opened.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// Failed to read the contents of a directory.
    ReadDir {
        /// Directory whose contents could not be read.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// Failed to obtain a directory entry during iteration.
    ReadDirEntry {
        /// Directory containing the problematic entry.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
    /// Failed to retrieve metadata for an entry.
    Metadata {
        /// Path whose metadata could not be retrieved.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        source: io::Error,
    },
}
