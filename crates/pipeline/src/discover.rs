//! Pack selection heuristics.
//!
//! A library root holds pack directories next to the directories and archives
//! the pipeline derives from them. Candidates are picked from the direct
//! children of the root by name and content:
//!
//! - fresh: a source pack with images and no derived siblings or archives yet
//! - reprocess: a pack holding archived media (jxl, video, gif)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::media::list_files;

/// Suffixes of directories the pipeline creates
pub const DERIVED_SUFFIXES: &[&str] = &["_dist", "_archive", "_upscaled", "_png"];

/// Sibling directories that mark a pack as already processed
const PROCESSED_SIBLINGS: &[&str] = &["_dist", "_archive", "_upscaled"];

/// Archive extensions that mark a pack as already processed
const PROCESSED_ARCHIVES: &[&str] = &["7z", "zip"];

/// Direct contents that make a directory a fresh candidate
pub const FRESH_MARKER_EXTENSIONS: &[&str] = &[".png", ".jpg"];

/// Direct contents that make a directory a reprocess candidate
pub const REPROCESS_MARKER_EXTENSIONS: &[&str] = &[".jxl", ".mp4", ".webm", ".gif"];

/// True for directory names ending in a derived suffix
pub fn is_derived_name(name: &str) -> bool {
    DERIVED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn has_processed_sibling(root: &Path, name: &str) -> bool {
    PROCESSED_ARCHIVES
        .iter()
        .any(|ext| root.join(format!("{}.{}", name, ext)).exists())
        || PROCESSED_SIBLINGS
            .iter()
            .any(|suffix| root.join(format!("{}{}", name, suffix)).exists())
}

fn directly_contains(dir: &Path, extensions: &[&str]) -> bool {
    !list_files(dir, extensions, false).is_empty()
}

/// Non-hidden child directory names of `root`, sorted
fn child_dirs(root: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

/// Packs under `root` that have not been processed yet
pub fn fresh_candidates(root: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(child_dirs(root)?
        .into_iter()
        .filter(|name| !is_derived_name(name))
        .filter(|name| !has_processed_sibling(root, name))
        .filter(|name| directly_contains(&root.join(name), FRESH_MARKER_EXTENSIONS))
        .map(PathBuf::from)
        .collect())
}

/// Packs under `root` holding archived media that can be reprocessed
pub fn reprocess_candidates(root: &Path) -> io::Result<Vec<PathBuf>> {
    Ok(child_dirs(root)?
        .into_iter()
        .filter(|name| !is_derived_name(name))
        .filter(|name| directly_contains(&root.join(name), REPROCESS_MARKER_EXTENSIONS))
        .map(PathBuf::from)
        .collect())
}
