//! Media catalog: file kinds, extension sets and directory enumeration.
//!
//! Packs are walked recursively and filtered by extension (case-insensitive).
//! Listing is sorted so stage input order is deterministic.

use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Still image extensions recognized anywhere in a pack.
pub const STILL_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".webp", ".jxl", ".avif"];

/// Animated / video extensions recognized anywhere in a pack.
pub const ANIMATION_EXTENSIONS: &[&str] = &[".gif", ".mp4", ".webm"];

/// Sources that are archived losslessly as JPEG XL.
pub const ARCHIVE_IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif"];

/// Already-compressed media copied verbatim into the archive tree.
pub const ARCHIVE_COPY_EXTENSIONS: &[&str] = &[".mp4", ".webp", ".webm"];

/// Animations re-encoded for distribution.
pub const DIST_ANIMATION_EXTENSIONS: &[&str] = &[".mp4", ".webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Still,
    Animation,
}

impl MediaKind {
    /// Infer the kind from the file extension; `None` for non-media files
    pub fn from_path(path: &Path) -> Option<Self> {
        if has_extension(path, ANIMATION_EXTENSIONS) {
            Some(MediaKind::Animation)
        } else if has_extension(path, STILL_EXTENSIONS) {
            Some(MediaKind::Still)
        } else {
            None
        }
    }
}

/// A file discovered in a pack. Identity is the path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaFile {
    path: PathBuf,
}

impl MediaFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_path(&self.path)
    }

    /// Lowercased extension without the leading dot
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
    }
}

/// Pixel dimensions reported by the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse ffprobe `csv=s=x:p=0` output such as `1920x1080`.
    ///
    /// Only the first non-empty line is considered; zero sizes are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
        let (width, height) = line.split_once('x')?;
        let width: u32 = width.trim().parse().ok()?;
        let height: u32 = height.trim().trim_end_matches('x').parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Dimensions multiplied by an integer factor (saturating)
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            width: self.width.saturating_mul(factor),
            height: self.height.saturating_mul(factor),
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Checks whether `path` ends with one of `extensions` (case-insensitive).
///
/// Extensions may be given with or without the leading dot.
pub fn has_extension(path: &Path, extensions: &[impl AsRef<str>]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|candidate| candidate.as_ref().trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Lists files under `root` whose extension is in `extensions`.
///
/// - Hidden directories (names starting with `.`) below the root are skipped
/// - `recursive = false` only looks at direct children
/// - A missing root or an empty extension set yields an empty list
/// - The result is sorted by path
pub fn list_files(root: &Path, extensions: &[impl AsRef<str>], recursive: bool) -> Vec<MediaFile> {
    if !root.is_dir() || extensions.is_empty() {
        return Vec::new();
    }

    let mut walker = WalkDir::new(root).follow_links(true);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files: Vec<MediaFile> = walker
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir()
                && entry.depth() > 0
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.')))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| has_extension(entry.path(), extensions))
        .map(|entry| MediaFile::new(entry.into_path()))
        .collect();

    files.sort();
    files
}
