//! Temp-then-rename helpers for stages that write intermediates.
//!
//! A canonical output path only ever receives a finished file: tools write to
//! a temp sibling first and the result is moved into place afterwards. Other
//! workers and later stages therefore never observe a half-written file at the
//! canonical path.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while moving an intermediate into place.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to move the finished file to the canonical path.
    #[error("Failed to move {} into place: {source}", from.display())]
    PromoteFailed {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to delete the superseded intermediate.
    #[error("Failed to delete intermediate {}: {source}", path.display())]
    DiscardFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Generates a temp sibling path for a canonical output.
///
/// The sibling keeps the canonical extension so tools that pick their muxer
/// from the file name still work: `out/a.png` + `upscale` -> `out/a.upscale-tmp.png`
///
/// # Arguments
///
/// * `canonical` - The final output path
/// * `tag` - Distinguishes several intermediates of the same output
pub fn temp_sibling(canonical: &Path, tag: &str) -> PathBuf {
    let stem = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match canonical.extension() {
        Some(ext) => format!("{}.{}-tmp.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}.{}-tmp", stem, tag),
    };
    canonical.with_file_name(name)
}

/// Moves a finished file to its canonical path.
///
/// Rename is tried first; a copy + remove is the fallback for filesystems that
/// refuse the rename.
pub fn promote(finished: &Path, canonical: &Path) -> Result<(), ReplaceError> {
    if fs::rename(finished, canonical).is_ok() {
        return Ok(());
    }

    fs::copy(finished, canonical).map_err(|source| ReplaceError::PromoteFailed {
        from: finished.to_path_buf(),
        source,
    })?;
    discard(finished)
}

/// Replaces an upscaled intermediate with its corrected version.
///
/// 1. Delete the intermediate
/// 2. Move the corrected file to the canonical path
///
/// # Arguments
///
/// * `corrected` - Output of the corrective downscale
/// * `intermediate` - Raw upscaler output, superseded by `corrected`
/// * `canonical` - Final output path
pub fn replace_corrected(
    corrected: &Path,
    intermediate: &Path,
    canonical: &Path,
) -> Result<(), ReplaceError> {
    discard(intermediate)?;
    promote(corrected, canonical)
}

/// Deletes a file, treating "already gone" as success.
pub fn discard(path: &Path) -> Result<(), ReplaceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ReplaceError::DiscardFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Best-effort removal of temp files on a failure path.
pub fn discard_all(paths: &[&Path]) {
    for path in paths {
        if let Err(e) = discard(path) {
            tracing::warn!(error = %e, "could not remove temp file");
        }
    }
}
