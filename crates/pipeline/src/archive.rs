//! Archive packaging through an external compressor.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::tool::{OutputMode, ToolCommand, ToolRunner};

/// Compressor binary
pub const SEVEN_ZIP_BINARY: &str = "7z";

/// Log file under the log directory that receives compressor output
pub const ARCHIVE_LOG: &str = "archive.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    SevenZip,
    Zip,
}

impl ArchiveFormat {
    /// Value for `7z -t` and the archive extension
    pub fn name(self) -> &'static str {
        match self {
            ArchiveFormat::SevenZip => "7z",
            ArchiveFormat::Zip => "zip",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error type for archive packaging
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Nothing to pack
    #[error("{} does not exist or is not a directory", .0.display())]
    MissingSource(PathBuf),

    /// Compressor exited with non-zero status
    #[error("7z failed for {} (exit {code:?}): {reason}", source_dir.display())]
    Failed {
        source_dir: PathBuf,
        code: Option<i32>,
        reason: String,
    },

    /// IO error while preparing or running the compressor
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Packs a directory into a single archive file
pub trait Archiver: Send + Sync {
    /// Compress the files of `source_dir` matching `whitelist` into
    /// `<dest_basename>.<format>`, returning the archive path.
    fn compress(
        &self,
        source_dir: &Path,
        dest_basename: &Path,
        format: ArchiveFormat,
        whitelist: &[String],
    ) -> Result<PathBuf, ArchiveError>;
}

/// `<dest_basename>.<ext>`; dots already in the basename are kept
pub fn archive_path(dest_basename: &Path, format: ArchiveFormat) -> PathBuf {
    let mut path = dest_basename.as_os_str().to_owned();
    path.push(".");
    path.push(format.name());
    PathBuf::from(path)
}

/// Build the 7z command line
///
/// Creates a command configured with:
/// - `a -bt -t<format> -mx1 -r` (add, timing stats, fast compression, recurse)
/// - the archive path
/// - one wildcard per whitelist entry (`*` when the whitelist is empty)
/// - `source_dir` as the child's working directory
pub fn build_7z_command(
    source_dir: &Path,
    archive: &Path,
    format: ArchiveFormat,
    whitelist: &[String],
) -> ToolCommand {
    let mut args: Vec<OsString> = vec![
        "a".into(),
        "-bt".into(),
        format!("-t{}", format.name()).into(),
        "-mx1".into(),
        "-r".into(),
        archive.as_os_str().to_owned(),
    ];
    if whitelist.is_empty() {
        args.push("*".into());
    } else {
        args.extend(whitelist.iter().map(Into::into));
    }

    ToolCommand::new(SEVEN_ZIP_BINARY, args).in_dir(source_dir)
}

/// [`Archiver`] backed by the 7-Zip command line tool
#[derive(Clone)]
pub struct SevenZip {
    runner: Arc<dyn ToolRunner>,
    log_dir: Option<PathBuf>,
}

impl SevenZip {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            runner,
            log_dir: None,
        }
    }

    /// Append compressor output to `<log_dir>/archive.log` instead of capturing it
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }
}

impl Archiver for SevenZip {
    fn compress(
        &self,
        source_dir: &Path,
        dest_basename: &Path,
        format: ArchiveFormat,
        whitelist: &[String],
    ) -> Result<PathBuf, ArchiveError> {
        if !source_dir.is_dir() {
            return Err(ArchiveError::MissingSource(source_dir.to_path_buf()));
        }

        // The child runs inside source_dir, so relative paths must be anchored here
        let mut archive = archive_path(dest_basename, format);
        if archive.is_relative() {
            archive = env::current_dir()?.join(archive);
        }

        if archive.exists() {
            info!(archive = %archive.display(), "removing existing archive");
            fs::remove_file(&archive)?;
        }

        let mut command = build_7z_command(source_dir, &archive, format, whitelist);
        if let Some(log_dir) = &self.log_dir {
            command.output_mode = OutputMode::AppendTo(log_dir.join(ARCHIVE_LOG));
        }
        debug!(command = %command.display_line(), "running 7z");
        let output = self.runner.run(&command)?;

        if output.success() {
            info!(archive = %archive.display(), "archive created");
            Ok(archive)
        } else {
            Err(ArchiveError::Failed {
                source_dir: source_dir.to_path_buf(),
                code: output.status,
                reason: output.stderr.trim().lines().last().unwrap_or("").to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::RunOutput;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records commands; writes the archive argument when `status` is 0
    #[derive(Default)]
    struct CompressorRunner {
        calls: Mutex<Vec<ToolCommand>>,
        status: i32,
        stderr: String,
    }

    impl CompressorRunner {
        fn failing(status: i32, stderr: &str) -> Self {
            Self {
                status,
                stderr: stderr.to_string(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<ToolCommand> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ToolRunner for CompressorRunner {
        fn run(&self, command: &ToolCommand) -> io::Result<RunOutput> {
            self.calls.lock().unwrap().push(command.clone());
            if self.status == 0 {
                fs::write(&command.args[5], b"archive")?;
            }
            Ok(RunOutput {
                stderr: self.stderr.clone(),
                ..RunOutput::exited(self.status)
            })
        }
    }

    fn pack_dir(temp_dir: &TempDir) -> PathBuf {
        let source = temp_dir.path().join("pack_archive");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("page.jxl"), b"jxl").unwrap();
        source
    }

    #[test]
    fn test_archive_path_keeps_dots() {
        assert_eq!(
            archive_path(Path::new("/lib/Vol.2"), ArchiveFormat::SevenZip),
            PathBuf::from("/lib/Vol.2.7z")
        );
        assert_eq!(
            archive_path(Path::new("pack"), ArchiveFormat::Zip),
            PathBuf::from("pack.zip")
        );
    }

    #[test]
    fn test_empty_whitelist_archives_everything() {
        let cmd = build_7z_command(
            Path::new("/lib/pack_dist"),
            Path::new("/lib/pack.zip"),
            ArchiveFormat::Zip,
            &[],
        );
        assert_eq!(
            cmd.args_lossy(),
            vec!["a", "-bt", "-tzip", "-mx1", "-r", "/lib/pack.zip", "*"]
        );
    }

    #[test]
    fn test_missing_source_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(CompressorRunner::default());
        let result = SevenZip::new(runner.clone()).compress(
            &temp_dir.path().join("pack_archive"),
            &temp_dir.path().join("pack"),
            ArchiveFormat::SevenZip,
            &[],
        );
        assert!(matches!(result, Err(ArchiveError::MissingSource(_))));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_compress_runs_inside_source_dir() {
        let temp_dir = TempDir::new().unwrap();
        let source = pack_dir(&temp_dir);
        let runner = Arc::new(CompressorRunner::default());

        let archive = SevenZip::new(runner.clone())
            .compress(
                &source,
                &temp_dir.path().join("pack"),
                ArchiveFormat::SevenZip,
                &["*.jxl".to_string()],
            )
            .unwrap();

        assert_eq!(archive, temp_dir.path().join("pack.7z"));
        assert!(archive.is_file());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, SEVEN_ZIP_BINARY);
        assert_eq!(calls[0].current_dir.as_deref(), Some(source.as_path()));
        assert_eq!(calls[0].output_mode, OutputMode::Capture);
        assert_eq!(calls[0].args_lossy().last().unwrap(), "*.jxl");
    }

    #[test]
    fn test_logging_appends_to_archive_log() {
        let temp_dir = TempDir::new().unwrap();
        let source = pack_dir(&temp_dir);
        let log_dir = temp_dir.path().join("logs");
        let runner = Arc::new(CompressorRunner::default());

        SevenZip::new(runner.clone())
            .with_log_dir(&log_dir)
            .compress(&source, &temp_dir.path().join("pack"), ArchiveFormat::Zip, &[])
            .unwrap();

        assert_eq!(
            runner.calls()[0].output_mode,
            OutputMode::AppendTo(log_dir.join("archive.log"))
        );
    }

    #[test]
    fn test_failure_reports_last_stderr_line() {
        let temp_dir = TempDir::new().unwrap();
        let source = pack_dir(&temp_dir);
        let stale = temp_dir.path().join("pack.7z");
        fs::write(&stale, b"previous run").unwrap();
        let runner = Arc::new(CompressorRunner::failing(2, "Scanning\nERROR: disk full\n"));

        let err = SevenZip::new(runner)
            .compress(&source, &temp_dir.path().join("pack"), ArchiveFormat::SevenZip, &[])
            .unwrap_err();

        match err {
            ArchiveError::Failed { code, reason, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(reason, "ERROR: disk full");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!stale.exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_7z_command_completeness(
            source in "[a-zA-Z0-9_/ -]{1,40}",
            archive in "[a-zA-Z0-9_/ .-]{1,40}",
            zip in any::<bool>(),
            patterns in prop::collection::vec("\\*\\.[a-z0-9]{2,4}", 1..5),
        ) {
            let format = if zip { ArchiveFormat::Zip } else { ArchiveFormat::SevenZip };
            let cmd = build_7z_command(Path::new(&source), Path::new(&archive), format, &patterns);
            let args = cmd.args_lossy();

            prop_assert_eq!(cmd.program.as_str(), "7z");
            prop_assert_eq!(cmd.current_dir.as_deref(), Some(Path::new(&source)));
            prop_assert_eq!(&args[0], "a");
            let type_flag = format!("-t{}", format.name());
            prop_assert!(args.contains(&type_flag));
            prop_assert!(args.contains(&"-mx1".to_string()));
            prop_assert!(args.contains(&"-r".to_string()));
            prop_assert_eq!(&args[5], &archive);
            prop_assert_eq!(&args[6..], &patterns[..]);
        }
    }
}
