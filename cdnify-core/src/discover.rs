//! File discovery: which inputs an operation processes.
//!
//! Two interchangeable strategies implement [`Discovery`]:
//!
//! - [`ExplicitList`] yields exactly the declared relative paths. Entries that
//!   do not exist are still yielded; the pipeline reports them as missing.
//! - [`RecursiveScan`] walks the root lazily with [`WalkFiles`] and keeps only
//!   paths accepted by its [`FileFilter`]. Filtering happens on the path, before
//!   any content is read.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// A discovered input: its path relative to the root and its full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub relative_path: PathBuf,
    pub path: PathBuf,
}

pub trait Discovery {
    fn discover<'a>(&'a self, root: &'a Path) -> Box<dyn Iterator<Item = DiscoveredFile> + 'a>;
}

/// Joins the normal components of a relative path with `/`.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Lazy depth-first walk yielding file paths relative to `root`.
///
/// Directories are read only when the walk reaches them, in sorted order, so
/// the sequence is deterministic. The walk consumes itself and cannot be
/// restarted; dropping it early stops all further directory reads.
#[derive(Debug)]
pub struct WalkFiles {
    root: PathBuf,
    dirs: Vec<PathBuf>,
    files: VecDeque<PathBuf>,
    skip: Vec<PathBuf>,
}

impl WalkFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: vec![PathBuf::new()],
            files: VecDeque::new(),
            skip: Vec::new(),
        }
    }

    /// Relative directories that are never entered.
    pub fn skipping<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.skip.extend(dirs.into_iter().map(Into::into));
        self
    }

    fn read_dir(&mut self, relative: &Path) -> io::Result<()> {
        let mut entries = fs::read_dir(self.root.join(relative))?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in entries {
            let child = relative.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !self.skip.iter().any(|s| s == &child) {
                    subdirs.push(child);
                }
            } else if file_type.is_file() || file_type.is_symlink() {
                self.files.push_back(child);
            }
        }
        // Stack order: first sorted subdirectory is visited first.
        self.dirs.extend(subdirs.into_iter().rev());
        Ok(())
    }
}

impl Iterator for WalkFiles {
    type Item = io::Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.files.pop_front() {
                return Some(Ok(file));
            }
            let dir = self.dirs.pop()?;
            if let Err(e) = self.read_dir(&dir) {
                return Some(Err(io::Error::new(
                    e.kind(),
                    format!("{}: {e}", self.root.join(&dir).display()),
                )));
            }
        }
    }
}

/// Path filter for scan mode. An empty filter accepts everything.
///
/// Each entry is one of: an exact relative path (`src/a.html`), a directory
/// prefix ending in `/` (`fonts/`), or an extension wildcard (`*.html`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFilter {
    entries: Vec<String>,
}

impl FileFilter {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| e.as_ref().trim_start_matches("./").to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, relative: &Path) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let path = slash_path(relative);
        self.entries.iter().any(|entry| {
            if let Some(ext) = entry.strip_prefix("*.") {
                path.rsplit('/')
                    .next()
                    .and_then(|name| name.rsplit_once('.'))
                    .is_some_and(|(_, e)| e == ext)
            } else if entry.ends_with('/') {
                path.starts_with(entry.as_str())
            } else {
                &path == entry
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExplicitList {
    files: Vec<String>,
}

impl ExplicitList {
    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }
}

impl Discovery for ExplicitList {
    fn discover<'a>(&'a self, root: &'a Path) -> Box<dyn Iterator<Item = DiscoveredFile> + 'a> {
        Box::new(self.files.iter().map(move |file| DiscoveredFile {
            relative_path: PathBuf::from(file),
            path: root.join(file),
        }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecursiveScan {
    filter: FileFilter,
    skip: Vec<PathBuf>,
}

impl RecursiveScan {
    pub fn new(filter: FileFilter) -> Self {
        Self {
            filter,
            skip: Vec::new(),
        }
    }

    pub fn skipping(mut self, dirs: Vec<PathBuf>) -> Self {
        self.skip = dirs;
        self
    }
}

impl Discovery for RecursiveScan {
    fn discover<'a>(&'a self, root: &'a Path) -> Box<dyn Iterator<Item = DiscoveredFile> + 'a> {
        let walk = WalkFiles::new(root).skipping(self.skip.iter().cloned());
        Box::new(walk.filter_map(move |item| match item {
            Ok(relative) if self.filter.matches(&relative) => Some(DiscoveredFile {
                path: root.join(&relative),
                relative_path: relative,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory during scan");
                None
            }
        }))
    }
}
