//! Output path planning.
//!
//! Every stage places its output by rewriting the first segment of the input
//! path (the pack directory) and swapping the extension. The next stage finds
//! its input by listing the rewritten directory, so the rule must stay stable:
//!
//! - `pack/sub/a.png` + `Suffix("archive")` + `jxl` -> `pack_archive/sub/a.jxl`
//! - `pack_upscaled/a.png` + `Root("pack_dist")` + `avif` -> `pack_dist/a.avif`
//! - `a.png` + anything + `jxl` -> `a.jxl` (top-level files only change extension)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How the first path segment of an input is rewritten
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OutputTarget {
    /// `<first>_<variant>`
    Suffix(String),
    /// First segment replaced by an explicit directory name
    Root(String),
}

impl OutputTarget {
    pub fn suffix(variant: impl Into<String>) -> Self {
        Self::Suffix(variant.into())
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self::Root(name.into())
    }

    fn rewrite(&self, first: &str) -> String {
        match self {
            OutputTarget::Suffix(variant) => format!("{}_{}", first, variant),
            OutputTarget::Root(name) => name.clone(),
        }
    }
}

/// A normalized, `/`-separated path split into segments.
///
/// Backslashes are treated as separators, `.` and empty segments are dropped
/// and `..` is resolved lexically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegments {
    absolute: bool,
    segments: Vec<String>,
}

impl PathSegments {
    /// Parse and normalize a raw path string
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.replace('\\', "/");
        let absolute = normalized.starts_with('/');
        let mut segments: Vec<String> = Vec::new();

        for part in normalized.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.last().is_some_and(|last| last != "..") {
                        segments.pop();
                    } else if !absolute {
                        segments.push("..".to_string());
                    }
                }
                other => segments.push(other.to_string()),
            }
        }

        Self { absolute, segments }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::parse(&path.to_string_lossy())
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Rewrite the first segment according to `target`
    pub fn rewrite_first(&mut self, target: &OutputTarget) {
        if let Some(first) = self.segments.first_mut() {
            *first = target.rewrite(first);
        }
    }

    /// Replace the extension of the final segment
    ///
    /// A final segment without an extension gets one appended.
    pub fn set_extension(&mut self, extension: &str) {
        let extension = extension.trim_start_matches('.');
        if let Some(last) = self.segments.last_mut() {
            let stem = Path::new(last.as_str())
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| last.clone());
            *last = format!("{}.{}", stem, extension);
        }
    }

    pub fn to_path_buf(&self) -> PathBuf {
        let joined = self.segments.join("/");
        if self.absolute {
            PathBuf::from(format!("/{}", joined))
        } else {
            PathBuf::from(joined)
        }
    }
}

/// Derive the output path for `input` without touching the filesystem.
///
/// Pure: the same `(input, target, extension)` always yields the same path.
pub fn derive_output_path(input: &Path, target: &OutputTarget, extension: &str) -> PathBuf {
    let mut segments = PathSegments::from_path(input);
    if segments.len() > 1 {
        segments.rewrite_first(target);
    }
    segments.set_extension(extension);
    segments.to_path_buf()
}

/// Plans output paths relative to an optional base directory (the library root).
///
/// Inputs under the base have the rule applied to their base-relative part, so
/// the first segment is the pack directory rather than a component of the root.
#[derive(Debug, Clone, Default)]
pub struct PathPlanner {
    base: Option<PathBuf>,
}

impl PathPlanner {
    pub fn new() -> Self {
        Self { base: None }
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    /// Derive the output path (no filesystem access)
    pub fn derive(&self, input: &Path, target: &OutputTarget, extension: &str) -> PathBuf {
        if let Some(base) = &self.base {
            if let Ok(relative) = input.strip_prefix(base) {
                return base.join(derive_output_path(relative, target, extension));
            }
        }
        derive_output_path(input, target, extension)
    }

    /// Derive the output path and create every ancestor directory
    ///
    /// Creating directories that already exist is not an error.
    pub fn prepare(
        &self,
        input: &Path,
        target: &OutputTarget,
        extension: &str,
    ) -> io::Result<PathBuf> {
        let output = self.derive(input, target, extension);
        ensure_parent_dir(&output)?;
        Ok(output)
    }
}

/// Create the parent directory of `path` if it has one
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
