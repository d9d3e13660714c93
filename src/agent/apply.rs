//! Applying uploads and single-path changes to a workspace directory.

use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use super::path_safety::{normalize_within, validate_path};
use super::writer::write_atomic;
use crate::models::ChangeKind;
use crate::sync::archive::unpack_archive;
use crate::{AppError, Result};

/// One incremental change as received from the client.
#[derive(Debug, Clone)]
pub struct FileChange {
    /// What happened to the path.
    pub kind: ChangeKind,
    /// Forward-slash path relative to the workspace root.
    pub path: String,
    /// Whether the path is a directory (ignored for deletes).
    pub is_dir: bool,
    /// Permission bits to apply, when given.
    pub mode: Option<u32>,
    /// New file content for file creates and updates.
    pub contents: Option<Bytes>,
}

/// Decide where a workspace lives on this host.
///
/// `path_field` is the upload's `"<local>::<remote>"` value. A remote part
/// starting with `~` is expanded against `home`; other relative remote
/// paths are placed under `home`. Without a remote part the workspace goes
/// to `<workspace_dir>/<id>`.
///
/// # Errors
///
/// Returns `AppError::Protocol` for an id unusable as a directory name and
/// `AppError::PathViolation` for a root that would wipe the file system
/// root or the home directory.
pub fn resolve_root(
    workspace_dir: &Path,
    home: &Path,
    id: &str,
    path_field: Option<&str>,
) -> Result<PathBuf> {
    let remote = path_field
        .and_then(|field| field.split_once("::"))
        .map(|(_, remote)| remote.trim())
        .filter(|remote| !remote.is_empty());

    let root = match remote {
        Some(remote) => {
            if let Some(rest) = remote.strip_prefix('~') {
                home.join(rest.trim_start_matches(['/', '\\']))
            } else if Path::new(remote).is_absolute() {
                PathBuf::from(remote)
            } else {
                home.join(remote)
            }
        }
        None => {
            if id.is_empty()
                || id == "."
                || id == ".."
                || id.contains(['/', '\\'])
            {
                return Err(AppError::Protocol(format!("invalid workspace id `{id}`")));
            }
            workspace_dir.join(id)
        }
    };

    if root.parent().is_none() || root == home {
        return Err(AppError::PathViolation(format!(
            "refusing to use {} as a workspace root",
            root.display()
        )));
    }
    Ok(root)
}

/// Wipe `root` and unpack `archive` (when given) into it.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory cannot be reset or the archive
/// cannot be unpacked.
pub fn install_upload(root: &Path, archive: Option<&[u8]>) -> Result<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to clear {}: {err}",
                root.display()
            )));
        }
    }
    std::fs::create_dir_all(root)?;
    if let Some(archive) = archive {
        unpack_archive(Cursor::new(archive), root)?;
    }
    debug!(root = %root.display(), "upload installed");
    Ok(())
}

/// Apply one change below `root`, returning the affected absolute path.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the path escapes the root,
/// `AppError::Protocol` if a file change carries no content, and
/// `AppError::Io` on file-system failures.
pub fn apply_change(root: &Path, change: &FileChange) -> Result<PathBuf> {
    match change.kind {
        ChangeKind::Delete => {
            let target = normalize_within(root, &change.path)?;
            if target == root.canonicalize()? {
                return Err(AppError::PathViolation(
                    "refusing to delete the workspace root".into(),
                ));
            }
            remove_path(&target)?;
            Ok(target)
        }
        ChangeKind::Create | ChangeKind::Update => {
            let target = validate_path(root, &change.path)?;
            if change.is_dir {
                std::fs::create_dir_all(&target)?;
            } else {
                let contents = change
                    .contents
                    .as_ref()
                    .ok_or_else(|| AppError::Protocol("missing form fields".into()))?;
                write_atomic(&target, contents)?;
            }
            if let Some(mode) = change.mode {
                set_mode(&target, mode)?;
            }
            Ok(target)
        }
    }
}

fn remove_path(target: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let removed = if metadata.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    };
    match removed {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(AppError::Io(format!(
            "failed to delete {}: {err}",
            target.display()
        ))),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_mode(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|err| AppError::Io(format!("failed to chmod {}: {err}", target.display())))
}

#[cfg(not(unix))]
fn set_mode(target: &Path, mode: u32) -> Result<()> {
    let mut permissions = std::fs::metadata(target)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(target, permissions)
        .map_err(|err| AppError::Io(format!("failed to chmod {}: {err}", target.display())))
}
