//! Domain model module declarations.

pub mod change;
pub mod workspace;

pub use change::{ChangeKind, ChangeRecord, SnapshotEntry, WatchError};
pub use workspace::{CommandSet, Workspace};
