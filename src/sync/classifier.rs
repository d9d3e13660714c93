//! Snapshot-versus-file-system diffing.
//!
//! The classifier owns the snapshot of a workspace: one entry per tracked
//! path, keyed by absolute path. Each pass walks the tree in lexical order
//! and reports creates and updates in walk order, followed by deletes for
//! tracked paths that were not seen. A deleted directory yields a single
//! delete; its tracked descendants are dropped silently once it is delivered.
//! Paths under a directory the walk could not read are never reported as
//! deleted.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::models::{ChangeKind, ChangeRecord, SnapshotEntry};
use crate::sync::ignore::IgnoreList;
use crate::AppError;

/// A change awaiting delivery.
///
/// Hand it back through [`ChangeClassifier::commit`] once delivered so the
/// snapshot records the new state. Until then the snapshot is untouched and
/// the next pass reports the same change again.
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// The change to deliver.
    pub record: ChangeRecord,
    entry: SnapshotEntry,
}

/// Result of one classification pass.
#[derive(Debug, Default)]
pub struct Pass {
    /// Creates and updates in walk order.
    pub changes: Vec<PendingChange>,
    /// Deletes in lexical order.
    pub deletes: Vec<PendingChange>,
    /// Walk failures. Tracked paths under a failing directory are kept.
    pub errors: Vec<AppError>,
}

/// Diffs a workspace tree against its last observed state.
#[derive(Debug)]
pub struct ChangeClassifier {
    workspace_id: String,
    root: PathBuf,
    snapshot: HashMap<PathBuf, SnapshotEntry>,
}

impl ChangeClassifier {
    /// Classifier with an empty snapshot.
    #[must_use]
    pub fn new(workspace_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            root: root.into(),
            snapshot: HashMap::new(),
        }
    }

    /// Workspace root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute) is tracked.
    #[must_use]
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.snapshot.contains_key(path)
    }

    /// Number of tracked paths.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.snapshot.len()
    }

    /// Drop all tracked state.
    pub fn reset(&mut self) {
        self.snapshot.clear();
    }

    /// Record the current tree without reporting anything.
    ///
    /// Returns walk failures; paths below a failing directory stay untracked.
    pub fn initial_scan(&mut self, ignores: &IgnoreList) -> Vec<AppError> {
        let mut errors = Vec::new();
        let mut walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    if !is_vanished(&err) {
                        errors.push(AppError::Watch(err.to_string()));
                    }
                    continue;
                }
            };
            if ignores.contains(entry.path()) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                let path = entry.into_path();
                self.snapshot
                    .insert(path.clone(), SnapshotEntry::from_metadata(path, &metadata));
            }
        }
        errors
    }

    /// Walk the tree and diff it against the snapshot.
    pub fn classify(&mut self, ignores: &IgnoreList) -> Pass {
        let mut pass = Pass::default();
        let mut found: HashSet<PathBuf> = HashSet::new();
        let mut unreadable: Vec<PathBuf> = Vec::new();
        let mut walker = WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    // A path removed mid-walk is simply not found.
                    if !is_vanished(&err) {
                        // Without a path nothing under the root can be trusted.
                        let failed = err.path().unwrap_or(&self.root).to_path_buf();
                        unreadable.push(failed);
                        pass.errors.push(AppError::Watch(err.to_string()));
                    }
                    continue;
                }
            };
            let path = entry.path();

            // ── Ignored ────────────────────────────────
            if ignores.contains(path) {
                self.snapshot.retain(|tracked, _| !tracked.starts_with(path));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let current = SnapshotEntry::from_metadata(path.to_path_buf(), &metadata);
            found.insert(current.path.clone());

            // ── Create / update ─────────────────────────
            let kind = match self.snapshot.get(path) {
                None => Some(ChangeKind::Create),
                Some(previous)
                    if !current.is_dir
                        && (current.modified > previous.modified
                            || current.mode != previous.mode) =>
                {
                    Some(ChangeKind::Update)
                }
                Some(_) => None,
            };
            if let Some(kind) = kind {
                pass.changes.push(PendingChange {
                    record: self.record(&current, kind),
                    entry: current,
                });
            }
        }

        // ── Deletes ────────────────────────────────────
        pass.deletes = self.collect_deletes(&found, &unreadable);
        pass
    }

    /// Record a delivered change in the snapshot.
    ///
    /// A delivered delete drops the path and everything tracked below it.
    pub fn commit(&mut self, change: PendingChange) {
        if change.record.kind == ChangeKind::Delete {
            self.drop_subtree(&change.entry.path);
        } else {
            self.snapshot.insert(change.entry.path.clone(), change.entry);
        }
    }

    /// Drop a tracked path whose change could not be delivered because the
    /// file disappeared.
    pub fn forget(&mut self, change: &PendingChange) {
        if change.record.kind == ChangeKind::Delete {
            self.drop_subtree(&change.entry.path);
        } else {
            self.snapshot.remove(&change.entry.path);
        }
    }

    fn drop_subtree(&mut self, root: &Path) {
        self.snapshot.retain(|tracked, _| !tracked.starts_with(root));
    }

    fn collect_deletes(
        &self,
        found: &HashSet<PathBuf>,
        unreadable: &[PathBuf],
    ) -> Vec<PendingChange> {
        let mut missing: Vec<&SnapshotEntry> = self
            .snapshot
            .values()
            .filter(|entry| !found.contains(&entry.path))
            .filter(|entry| !unreadable.iter().any(|dir| entry.path.starts_with(dir)))
            .collect();
        missing.sort_by(|a, b| a.path.cmp(&b.path));

        let mut emitted: Vec<&Path> = Vec::new();
        let mut deletes = Vec::new();
        for entry in missing {
            if emitted.iter().any(|ancestor| entry.path.starts_with(ancestor)) {
                continue;
            }
            deletes.push(PendingChange {
                record: self.record(entry, ChangeKind::Delete),
                entry: entry.clone(),
            });
            emitted.push(&entry.path);
        }
        deletes
    }

    fn record(&self, entry: &SnapshotEntry, kind: ChangeKind) -> ChangeRecord {
        ChangeRecord {
            workspace_id: self.workspace_id.clone(),
            path: entry
                .path
                .strip_prefix(&self.root)
                .unwrap_or(&entry.path)
                .to_path_buf(),
            kind,
            is_dir: entry.is_dir,
            mode: entry.mode,
        }
    }
}

fn is_vanished(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == ErrorKind::NotFound)
}
