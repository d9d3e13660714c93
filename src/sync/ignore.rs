//! Ignore lists: paths the watcher and the archive skip.
//!
//! The default provider reads an ignore file at the workspace root. Each
//! non-blank line that does not start with `#` is a glob relative to the
//! root; every path it matches at load time is ignored, and an ignored
//! directory hides everything below it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

/// Absolute paths excluded from syncing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    paths: HashSet<PathBuf>,
}

impl IgnoreList {
    /// Build a list from explicit absolute paths.
    #[must_use]
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `path` itself is ignored.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Number of ignored paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether nothing is ignored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Source of the ignore list for a workspace root, consulted on every pass.
pub trait IgnoreProvider: Send + Sync {
    /// Load the current ignore list for `root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Watch` if the list cannot be read or parsed.
    fn load(&self, root: &Path) -> Result<IgnoreList>;
}

/// Reads glob patterns from a file at the workspace root.
#[derive(Debug, Clone)]
pub struct FileIgnoreProvider {
    file_name: String,
}

impl FileIgnoreProvider {
    /// Provider reading `file_name` (for example `.tetherignore`).
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }
}

impl IgnoreProvider for FileIgnoreProvider {
    fn load(&self, root: &Path) -> Result<IgnoreList> {
        let file = root.join(&self.file_name);
        let raw = match std::fs::read_to_string(&file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IgnoreList::default());
            }
            Err(err) => {
                return Err(AppError::Watch(format!(
                    "failed to read {}: {err}",
                    file.display()
                )));
            }
        };

        let base = glob::Pattern::escape(&root.to_string_lossy());
        let mut paths = HashSet::new();
        for pattern in raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
        {
            let full = format!("{base}/{}", pattern.trim_start_matches('/').trim_end_matches('/'));
            let matches = glob::glob(&full).map_err(|err| {
                AppError::Watch(format!("invalid ignore pattern `{pattern}`: {err}"))
            })?;
            // Unreadable entries cannot be walked either, so they are skipped.
            paths.extend(matches.filter_map(std::result::Result::ok));
        }
        debug!(root = %root.display(), count = paths.len(), "ignore list loaded");
        Ok(IgnoreList { paths })
    }
}

/// Provider that never ignores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnore;

impl IgnoreProvider for NoIgnore {
    fn load(&self, _root: &Path) -> Result<IgnoreList> {
        Ok(IgnoreList::default())
    }
}
