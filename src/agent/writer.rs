//! Atomic file writes.
//!
//! Content goes to a temp file next to the target, which is then renamed
//! over it, so readers never observe a partially written file.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Write `content` to `target`, creating parent directories as needed.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns `AppError::Io` if a directory, the temp file or the rename fails.
pub fn write_atomic(target: &Path, content: &[u8]) -> Result<usize> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", target.display())))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create parent directories for {}: {err}",
            target.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(content)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.persist(target).map_err(|err| {
        AppError::Io(format!("failed to persist {}: {err}", target.display()))
    })?;
    Ok(content.len())
}
