//! Tool invoker: renders templates, runs them and applies the verification policy.
//!
//! File-producing tools are judged by their artifact alone: success means the
//! output exists and is non-empty, whatever the exit code says. Several of the
//! encoders exit non-zero after writing a good file, and some exit zero without
//! writing anything. The probe is the exception and is judged by exit status.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::runner::{OutputMode, RunOutput, ToolCommand, ToolRunner};
use crate::format::{TemplateRegistry, TemplateVars, ToolOperation, VerifyRule, FFMPEG_BINARY};
use crate::media::Dimensions;

/// ffmpeg wrapper with a progress bar, used for video encodes when installed
pub const PROGRESS_BINARY: &str = "ffpb";

/// Number of stderr lines kept as a failure reason
const STDERR_TAIL_LINES: usize = 3;

/// Error type for external tool invocations
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The tool did not leave a non-empty output file
    #[error("{tool} produced no output at {}: {reason}", output.display())]
    NoOutput {
        tool: String,
        output: PathBuf,
        reason: String,
    },

    /// The probe exited non-zero or could not be started
    #[error("probe failed for {}: {reason}", input.display())]
    ProbeFailed { input: PathBuf, reason: String },

    /// The probe succeeded but printed something other than `WxH`
    #[error("could not parse dimensions from probe output '{0}'")]
    UnparsableDimensions(String),

    /// The operation is judged by exit status and has no artifact to verify
    #[error("{} does not produce an output file", .0.log_name())]
    NotFileProducing(ToolOperation),
}

/// A verified output artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub output: PathBuf,
    pub bytes: u64,
}

/// Size of `path` if it is a non-empty regular file
pub fn verify_output(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file() && meta.len() > 0)
        .map(|meta| meta.len())
}

/// Builds and runs tool commands on behalf of the stages
#[derive(Clone)]
pub struct ToolInvoker {
    runner: Arc<dyn ToolRunner>,
    templates: TemplateRegistry,
    log_dir: Option<PathBuf>,
    progress_binary: bool,
}

impl ToolInvoker {
    pub fn new(runner: Arc<dyn ToolRunner>, templates: TemplateRegistry) -> Self {
        Self {
            runner,
            templates,
            log_dir: None,
            progress_binary: false,
        }
    }

    /// Append tool output to `<log_dir>/<operation>.log` instead of capturing it
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Swap ffmpeg for [`PROGRESS_BINARY`] on video encodes
    pub fn with_progress_binary(mut self, enabled: bool) -> Self {
        self.progress_binary = enabled;
        self
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Render the command for `operation` without running it
    pub fn build_command(&self, operation: ToolOperation, vars: &TemplateVars<'_>) -> ToolCommand {
        let (program, args) = self.templates.template_for(operation).render(vars);
        let mut command = ToolCommand::new(program, args);

        let wants_progress = matches!(
            operation,
            ToolOperation::Transcode(format) if format.supports_progress_binary()
        );
        if self.progress_binary && wants_progress && command.program == FFMPEG_BINARY {
            command.program = PROGRESS_BINARY.to_string();
            command.output_mode = OutputMode::Inherit;
        } else if let Some(log_dir) = &self.log_dir {
            command.output_mode =
                OutputMode::AppendTo(log_dir.join(format!("{}.log", operation.log_name())));
        }

        command
    }

    /// Run a file-producing operation and verify its output artifact.
    ///
    /// Never panics and never returns early on a non-zero exit code: the
    /// output file is the only success criterion.
    ///
    /// # Arguments
    /// * `operation` - Which template to render
    /// * `vars` - Placeholder values; `vars.output` is the file that is verified
    ///
    /// # Returns
    /// * `Ok(Verified)` - The output exists and is non-empty
    /// * `Err(InvokeError::NoOutput)` - Anything else, with the stderr tail or
    ///   spawn error as the reason
    /// * `Err(InvokeError::NotFileProducing)` - `operation` is the probe; nothing is run
    pub fn invoke(
        &self,
        operation: ToolOperation,
        vars: &TemplateVars<'_>,
    ) -> Result<Verified, InvokeError> {
        if operation.verify_rule() != VerifyRule::OutputArtifact {
            return Err(InvokeError::NotFileProducing(operation));
        }
        let command = self.build_command(operation, vars);
        debug!(command = %command.display_line(), "running tool");

        let result = self.runner.run(&command);
        let output = vars.output.unwrap_or(vars.input).to_path_buf();

        match verify_output(&output) {
            Some(bytes) => {
                if let Ok(run) = &result {
                    if !run.success() {
                        debug!(
                            tool = %command.program,
                            status = ?run.status,
                            "tool exited non-zero but produced output"
                        );
                    }
                }
                Ok(Verified { output, bytes })
            }
            None => Err(InvokeError::NoOutput {
                tool: command.program,
                output,
                reason: failure_reason(&result),
            }),
        }
    }

    /// Probe the pixel dimensions of `input`.
    ///
    /// Fails on a non-zero exit status, a spawn error or unparsable output.
    pub fn probe_dimensions(&self, input: &Path) -> Result<Dimensions, InvokeError> {
        let mut command = self.build_command(ToolOperation::Probe, &TemplateVars::input_only(input));
        // Probe output is parsed, so it is always captured
        command.output_mode = OutputMode::Capture;
        debug!(command = %command.display_line(), "probing dimensions");

        let result = self.runner.run(&command);
        match result {
            Ok(run) if run.success() => Dimensions::parse(&run.stdout)
                .ok_or_else(|| InvokeError::UnparsableDimensions(run.stdout.trim().to_string())),
            other => Err(InvokeError::ProbeFailed {
                input: input.to_path_buf(),
                reason: failure_reason(&other),
            }),
        }
    }
}

/// Human-readable reason for a failed run
fn failure_reason(result: &io::Result<RunOutput>) -> String {
    match result {
        Err(err) => format!("failed to start: {}", err),
        Ok(run) => {
            let tail = stderr_tail(&run.stderr);
            match (run.status, tail.is_empty()) {
                (Some(code), true) => format!("exit status {}", code),
                (None, true) => "terminated by signal".to_string(),
                (_, false) => tail,
            }
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TargetFormat;
    use crate::tool::runner::fake::FakeRunner;
    use tempfile::TempDir;

    struct FailingSpawn;

    impl ToolRunner for FailingSpawn {
        fn run(&self, _command: &ToolCommand) -> io::Result<RunOutput> {
            Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"))
        }
    }

    fn invoker(runner: Arc<dyn ToolRunner>) -> ToolInvoker {
        ToolInvoker::new(runner, TemplateRegistry::new())
    }

    #[test]
    fn test_non_zero_exit_with_output_is_success() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("a.png");
        let output = temp_dir.path().join("a.jxl");
        let runner = Arc::new(FakeRunner::new().exit_code(1));

        let verified = invoker(runner)
            .invoke(
                ToolOperation::Transcode(TargetFormat::Jxl),
                &TemplateVars::new(&input, &output, false),
            )
            .unwrap();

        assert_eq!(verified.output, output);
        assert!(verified.bytes > 0);
    }

    #[test]
    fn test_zero_exit_without_output_is_failure() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("a.png");
        let output = temp_dir.path().join("a.jxl");
        let runner = Arc::new(FakeRunner::new().silent("cjxl"));

        let err = invoker(runner)
            .invoke(
                ToolOperation::Transcode(TargetFormat::Jxl),
                &TemplateVars::new(&input, &output, false),
            )
            .unwrap_err();

        match err {
            InvokeError::NoOutput { tool, reason, .. } => {
                assert_eq!(tool, "cjxl");
                assert_eq!(reason, "cjxl finished");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_output_is_failure() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("a.png");
        let output = temp_dir.path().join("a.jxl");
        fs::write(&output, b"").unwrap();
        let runner = Arc::new(FakeRunner::new().silent("cjxl"));

        let result = invoker(runner).invoke(
            ToolOperation::Transcode(TargetFormat::Jxl),
            &TemplateVars::new(&input, &output, false),
        );
        assert!(matches!(result, Err(InvokeError::NoOutput { .. })));
    }

    #[test]
    fn test_spawn_failure_is_reported_after_output_check() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("a.png");
        let output = temp_dir.path().join("a.avif");

        let err = invoker(Arc::new(FailingSpawn))
            .invoke(
                ToolOperation::Transcode(TargetFormat::Avif),
                &TemplateVars::new(&input, &output, false),
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"), "{err}");
    }

    #[test]
    fn test_invoke_refuses_exit_status_operations() {
        let input = PathBuf::from("/pack/a.png");
        let runner = Arc::new(FakeRunner::new().with_dimensions(&input, Dimensions::new(1200, 900)));

        let err = invoker(runner.clone())
            .invoke(ToolOperation::Probe, &TemplateVars::input_only(&input))
            .unwrap_err();

        assert!(matches!(err, InvokeError::NotFileProducing(ToolOperation::Probe)));
        assert_eq!(err.to_string(), "probe does not produce an output file");
        assert!(runner.calls_to("ffprobe").is_empty());
    }

    #[test]
    fn test_probe_parses_dimensions() {
        let input = PathBuf::from("/pack/a.png");
        let runner = Arc::new(FakeRunner::new().with_dimensions(&input, Dimensions::new(1200, 900)));
        let dims = invoker(runner.clone()).probe_dimensions(&input).unwrap();

        assert_eq!(dims, Dimensions::new(1200, 900));
        let calls = runner.calls_to("ffprobe");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].output_mode, OutputMode::Capture);
    }

    #[test]
    fn test_probe_failure() {
        let runner = Arc::new(FakeRunner::new());
        let err = invoker(runner).probe_dimensions(Path::new("/pack/broken.png")).unwrap_err();
        match err {
            InvokeError::ProbeFailed { reason, .. } => {
                assert!(reason.contains("Invalid data"), "{reason}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_log_dir_routes_output_to_operation_log() {
        let input = PathBuf::from("a.png");
        let output = PathBuf::from("a.avif");
        let invoker = invoker(Arc::new(FakeRunner::new())).with_log_dir("/var/log/gallery");

        let command = invoker.build_command(
            ToolOperation::Transcode(TargetFormat::Avif),
            &TemplateVars::new(&input, &output, false),
        );
        assert_eq!(
            command.output_mode,
            OutputMode::AppendTo(PathBuf::from("/var/log/gallery/transcode_avif.log"))
        );
    }

    #[test]
    fn test_progress_binary_only_for_video() {
        let input = PathBuf::from("clip.webm");
        let output = PathBuf::from("clip.mp4");
        let invoker = invoker(Arc::new(FakeRunner::new())).with_progress_binary(true);

        let video = invoker.build_command(
            ToolOperation::Transcode(TargetFormat::Mp4),
            &TemplateVars::new(&input, &output, true),
        );
        assert_eq!(video.program, PROGRESS_BINARY);
        assert_eq!(video.output_mode, OutputMode::Inherit);

        let still = invoker.build_command(
            ToolOperation::Transcode(TargetFormat::Avif),
            &TemplateVars::new(&input, &output, true),
        );
        assert_eq!(still.program, FFMPEG_BINARY);
        assert_eq!(still.output_mode, OutputMode::Capture);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = stderr_tail("a\n\nb\nc\n d \n");
        assert_eq!(tail, "b | c | d");
        assert_eq!(failure_reason(&Ok(RunOutput::exited(2))), "exit status 2");
    }
}
