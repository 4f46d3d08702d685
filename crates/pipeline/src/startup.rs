//! Preflight checks for the external tools the pipeline drives.
//!
//! Missing tools are reported, not fatal: a library that only needs archiving
//! can run without the upscaler installed, and the affected files simply fail.

use tracing::{info, warn};

use crate::archive::SEVEN_ZIP_BINARY;
use crate::tool::PROGRESS_BINARY;

/// Binaries used by the default templates
pub const REQUIRED_TOOLS: &[&str] = &[
    "ffmpeg",
    "ffprobe",
    SEVEN_ZIP_BINARY,
    "cjxl",
    "djxl",
    "realesrgan-ncnn-vulkan",
];

/// Result of the preflight
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// Required tools that could not be found
    pub missing: Vec<String>,
    /// Whether the progress-bar ffmpeg wrapper is installed
    pub progress_binary: bool,
}

/// Check whether `tool` resolves on `PATH`
pub fn is_available(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// Tools from `tools` that cannot be found, in input order
pub fn missing_tools(tools: &[&str]) -> Vec<String> {
    tools
        .iter()
        .filter(|tool| !is_available(tool))
        .map(|tool| tool.to_string())
        .collect()
}

/// Check the required tools and the optional progress wrapper, logging the result
pub fn run_preflight() -> PreflightReport {
    let report = PreflightReport {
        missing: missing_tools(REQUIRED_TOOLS),
        progress_binary: is_available(PROGRESS_BINARY),
    };

    for tool in &report.missing {
        warn!(tool = %tool, "required tool not found on PATH");
    }
    if report.progress_binary {
        info!(tool = PROGRESS_BINARY, "progress wrapper found, used for video encodes");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_is_missing() {
        let missing = missing_tools(&["gallery-prep-definitely-not-installed"]);
        assert_eq!(missing, vec!["gallery-prep-definitely-not-installed".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_is_available() {
        assert!(is_available("sh"));
        assert!(missing_tools(&["sh"]).is_empty());
    }

    #[test]
    fn test_required_tools_cover_default_templates() {
        use crate::format::{TargetFormat, ToolOperation, ToolTemplate};

        let operations = TargetFormat::ALL
            .into_iter()
            .map(ToolOperation::Transcode)
            .chain([
                ToolOperation::Probe,
                ToolOperation::DecodeJxl,
                ToolOperation::Upscale,
                ToolOperation::Downscale,
            ]);
        for operation in operations {
            let template = ToolTemplate::parse(operation.default_template()).unwrap();
            assert!(
                REQUIRED_TOOLS.contains(&template.program()),
                "{} is not checked at startup",
                template.program()
            );
        }
    }
}
