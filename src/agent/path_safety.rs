//! Path validation against a workspace root.
//!
//! Incoming change paths are relative, forward-slash separated and
//! untrusted. They are normalized lexically, must stay below the root, and
//! for writes an existing symlink may not lead outside the root.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Join `candidate` onto `root` lexically, rejecting `..` escapes.
///
/// Absolute candidates are treated as relative to the root. Does not touch
/// the file system beyond canonicalizing the root.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the root cannot be canonicalized or
/// the candidate climbs above it.
pub fn normalize_within(root: &Path, candidate: &str) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("workspace root invalid: {err}")))?;

    let mut normalized = PathBuf::new();
    for component in candidate
        .split('/')
        .filter(|part| !part.is_empty())
        .flat_map(|part| Path::new(part).components())
    {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(format!(
                        "path escapes workspace: {candidate}"
                    )));
                }
            }
            Component::Normal(part) => normalized.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(root.join(normalized))
}

/// Like [`normalize_within`], and additionally resolves an existing target
/// to make sure symlinks do not lead outside the root.
///
/// # Errors
///
/// Returns `AppError::PathViolation` on any escape.
pub fn validate_path(root: &Path, candidate: &str) -> Result<PathBuf> {
    let absolute = normalize_within(root, candidate)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("workspace root invalid: {err}")))?;

    if absolute.exists() {
        let resolved = absolute
            .canonicalize()
            .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
        if !resolved.starts_with(&canonical_root) {
            return Err(AppError::PathViolation(format!(
                "symlink target escapes workspace: {candidate}"
            )));
        }
    }
    Ok(absolute)
}
