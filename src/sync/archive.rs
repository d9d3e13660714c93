//! Gzip-compressed tar archives of a workspace.
//!
//! The client stages the archive in an anonymous temp file so an upload
//! can be retried from offset zero without re-walking the tree. The agent
//! unpacks the same format into the workspace root.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;
use walkdir::WalkDir;

use crate::sync::ignore::IgnoreList;
use crate::{AppError, Result};

/// Archive `root` (minus ignored paths) into a temp file rewound to offset 0.
///
/// Paths that vanish during the walk are skipped.
///
/// # Errors
///
/// Returns `AppError::Io` if the temp file cannot be written or a path
/// cannot be read for reasons other than having vanished.
pub fn stage_archive(root: &Path, ignores: &IgnoreList) -> Result<File> {
    let staging = tempfile::tempfile()
        .map_err(|err| AppError::Io(format!("failed to create staging file: {err}")))?;
    let mut builder = tar::Builder::new(GzEncoder::new(staging, Compression::default()));
    builder.follow_symlinks(false);

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    let mut entries = 0usize;

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) {
                    continue;
                }
                return Err(AppError::Io(format!("archive walk failed: {err}")));
            }
        };
        let path = entry.path();
        if ignores.contains(path) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };

        let appended = if entry.file_type().is_dir() {
            builder.append_dir(rel, path)
        } else {
            builder.append_path_with_name(path, rel)
        };
        match appended {
            Ok(()) => entries += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "skipping vanished path");
            }
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to archive {}: {err}",
                    path.display()
                )));
            }
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| AppError::Io(format!("failed to finish archive: {err}")))?;
    let mut staged = encoder
        .finish()
        .map_err(|err| AppError::Io(format!("failed to finish compression: {err}")))?;
    staged.seek(SeekFrom::Start(0))?;
    debug!(root = %root.display(), entries, "archive staged");
    Ok(staged)
}

/// Unpack a gzip tar stream into `dest`, creating it if needed.
///
/// Entries that would land outside `dest` are rejected by the tar reader.
///
/// # Errors
///
/// Returns `AppError::Io` if the stream is corrupt or a file cannot be written.
pub fn unpack_archive<R: Read>(reader: R, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|err| AppError::Io(format!("failed to unpack archive: {err}")))
}
