//! Change detection records produced by the local watcher.

use std::fs::Metadata;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::AppError;

/// Kind of change detected for a path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Path appeared since the previous pass.
    Create,
    /// File content time or permissions changed.
    Update,
    /// Path disappeared since the previous pass.
    Delete,
}

impl ChangeKind {
    /// Wire name of the change kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Last observed state of one tracked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Absolute path on the local file system.
    pub path: PathBuf,
    /// Modification time at the last observation.
    pub modified: SystemTime,
    /// Permission bits at the last observation.
    pub mode: u32,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

impl SnapshotEntry {
    /// Capture the observable state of `path` from its metadata.
    #[must_use]
    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            path,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            mode: permission_bits(metadata),
            is_dir: metadata.is_dir(),
        }
    }
}

/// One detected change, consumed exactly once by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Workspace the change belongs to.
    pub workspace_id: String,
    /// Path relative to the workspace root.
    pub path: PathBuf,
    /// What happened to the path.
    pub kind: ChangeKind,
    /// Whether the path is (or was) a directory.
    pub is_dir: bool,
    /// Permission bits observed for the path.
    pub mode: u32,
}

impl ChangeRecord {
    /// Relative path with forward slashes, as sent on the wire.
    #[must_use]
    pub fn wire_path(&self) -> String {
        self.path
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Error raised while watching a workspace, tagged with its workspace.
#[derive(Debug)]
pub struct WatchError {
    /// Workspace whose watcher failed.
    pub workspace_id: String,
    /// Underlying failure.
    pub error: AppError,
}

/// Permission bits of a file, portable across platforms.
#[cfg(unix)]
#[must_use]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Permission bits of a file, portable across platforms.
#[cfg(not(unix))]
#[must_use]
pub fn permission_bits(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}
