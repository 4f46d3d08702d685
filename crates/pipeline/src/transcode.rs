//! Transcode stage: one external encode per file, fanned out over the worker pool.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::batch::{run_planned_batch, BatchReport, ItemOutcome};
use crate::format::{TargetFormat, TemplateVars, ToolOperation};
use crate::media::{has_extension, MediaFile};
use crate::path_plan::{ensure_parent_dir, OutputTarget, PathPlanner};
use crate::tool::{verify_output, ToolInvoker};

/// Options shared by every stage of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Replace outputs that already exist instead of skipping them
    pub overwrite: bool,
}

/// Decision for an output path before any tool runs
pub(crate) enum Existing {
    Proceed,
    Skip,
    Fail(String),
}

/// Apply the skip-if-exists / overwrite rule to `output`
pub(crate) fn check_existing(output: &Path, options: StageOptions) -> Existing {
    if !output.exists() {
        return Existing::Proceed;
    }
    if !options.overwrite {
        warn!(output = %output.display(), "output exists, skipping");
        return Existing::Skip;
    }
    match fs::remove_file(output) {
        Ok(()) => Existing::Proceed,
        Err(e) => Existing::Fail(format!("could not remove existing output: {}", e)),
    }
}

/// Operation used to produce `format` from `input`
///
/// JPEG XL sources are decoded with djxl rather than ffmpeg.
pub fn operation_for(input: &Path, format: TargetFormat) -> ToolOperation {
    if format == TargetFormat::Png && has_extension(input, &[".jxl"]) {
        ToolOperation::DecodeJxl
    } else {
        ToolOperation::Transcode(format)
    }
}

pub struct TranscodeStage<'a> {
    invoker: &'a ToolInvoker,
    planner: &'a PathPlanner,
    options: StageOptions,
}

impl<'a> TranscodeStage<'a> {
    pub fn new(invoker: &'a ToolInvoker, planner: &'a PathPlanner, options: StageOptions) -> Self {
        Self {
            invoker,
            planner,
            options,
        }
    }

    /// Transcode every file to `format` under `target`.
    ///
    /// The worker count is capped by the format (avif and mp4 run one at a time).
    /// Inputs that would write the same output (`a.png` and `a.jpg`) fail
    /// except for the first one.
    pub fn transcode(
        &self,
        files: &[MediaFile],
        target: &OutputTarget,
        format: TargetFormat,
        concurrency: usize,
    ) -> BatchReport {
        let workers = format.effective_concurrency(concurrency);
        info!(format = %format, files = files.len(), workers, "transcoding");
        run_planned_batch(
            files,
            workers,
            |file| self.planner.derive(file.path(), target, format.extension()),
            |file, output| self.transcode_one(file, output, format),
        )
    }

    /// Transcode a single file to `output`; never panics on tool failure
    pub fn transcode_one(&self, file: &MediaFile, output: &Path, format: TargetFormat) -> ItemOutcome {
        match check_existing(output, self.options) {
            Existing::Proceed => {}
            Existing::Skip => return ItemOutcome::Skipped,
            Existing::Fail(reason) => return ItemOutcome::Failed(reason),
        }
        if let Err(e) = ensure_parent_dir(output) {
            return ItemOutcome::failed(format!("cannot create output directory: {}", e));
        }

        let vars = TemplateVars::new(file.path(), output, self.options.overwrite);
        match self.invoker.invoke(operation_for(file.path(), format), &vars) {
            Ok(_) => ItemOutcome::Success,
            Err(e) => {
                warn!(input = %file.path().display(), error = %e, "transcode failed");
                ItemOutcome::failed(e.to_string())
            }
        }
    }

    /// Copy files that are already in a final format into `target`, keeping
    /// their extension. Same skip and verification rules as a transcode.
    pub fn copy_files(
        &self,
        files: &[MediaFile],
        target: &OutputTarget,
        concurrency: usize,
    ) -> BatchReport {
        info!(files = files.len(), "copying already-compressed media");
        run_planned_batch(
            files,
            concurrency,
            |file| {
                let extension = file.extension().unwrap_or_default();
                self.planner.derive(file.path(), target, &extension)
            },
            |file, output| self.copy_one(file, output),
        )
    }

    fn copy_one(&self, file: &MediaFile, output: &Path) -> ItemOutcome {
        match check_existing(output, self.options) {
            Existing::Proceed => {}
            Existing::Skip => return ItemOutcome::Skipped,
            Existing::Fail(reason) => return ItemOutcome::Failed(reason),
        }

        let copied = ensure_parent_dir(output).and_then(|_| fs::copy(file.path(), output));
        match (copied, verify_output(output)) {
            (Ok(_), Some(_)) => ItemOutcome::Success,
            (Ok(_), None) => ItemOutcome::failed("copied file is empty"),
            (Err(e), _) => {
                warn!(input = %file.path().display(), error = %e, "copy failed");
                ItemOutcome::failed(format!("copy failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TemplateRegistry;
    use crate::tool::runner::fake::{output_arg, FakeRunner};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        runner: Arc<FakeRunner>,
        invoker: ToolInvoker,
        planner: PathPlanner,
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let runner = Arc::new(runner);
        let invoker = ToolInvoker::new(runner.clone(), TemplateRegistry::new());
        let planner = PathPlanner::with_base(temp_dir.path());
        Fixture {
            temp_dir,
            runner,
            invoker,
            planner,
        }
    }

    fn make_pack(root: &Path, names: &[&str]) -> Vec<MediaFile> {
        names
            .iter()
            .map(|name| {
                let path = root.join("pack").join(name);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, b"source").unwrap();
                MediaFile::new(path)
            })
            .collect()
    }

    #[test]
    fn test_transcode_writes_to_variant_directory() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["a.png", "sub/b.jpg"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());

        let report = stage.transcode(&files, &OutputTarget::suffix("archive"), TargetFormat::Jxl, 4);

        assert_eq!(report.succeeded, 2);
        let root = fx.temp_dir.path();
        assert!(root.join("pack_archive/a.jxl").is_file());
        assert!(root.join("pack_archive/sub/b.jxl").is_file());
        let outputs: Vec<PathBuf> = fx
            .runner
            .calls_to("cjxl")
            .iter()
            .filter_map(output_arg)
            .collect();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_second_run_skips_without_invocations() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["a.png", "b.png", "c.png"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());
        let target = OutputTarget::suffix("archive");

        let first = stage.transcode(&files, &target, TargetFormat::Jxl, 2);
        let calls_after_first = fx.runner.calls().len();
        let second = stage.transcode(&files, &target, TargetFormat::Jxl, 2);

        assert_eq!(first.succeeded, 3);
        assert_eq!(second.skipped_count(), 3);
        assert_eq!(second.succeeded, 0);
        assert_eq!(fx.runner.calls().len(), calls_after_first);
    }

    #[test]
    fn test_same_stem_inputs_do_not_share_an_output() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["a.jpg", "a.png", "b.png"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());

        let report = stage.transcode(&files, &OutputTarget::suffix("archive"), TargetFormat::Jxl, 4);

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.skipped_count(), 0);
        let reason = &report.failed[files[1].path()];
        assert!(reason.contains("collides with"), "{}", reason);
        assert!(reason.contains("a.jpg"), "{}", reason);
        // Only the first claimant is encoded
        assert_eq!(fx.runner.calls_to("cjxl").len(), 2);

        // A rerun keeps reporting the collision instead of a skip
        let again = stage.transcode(&files, &OutputTarget::suffix("archive"), TargetFormat::Jxl, 4);
        assert_eq!(again.skipped_count(), 2);
        assert_eq!(again.failed_count(), 1);
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    #[test]
    fn test_copy_collision_on_extension_case() {
        let fx = fixture(FakeRunner::new());
        // Extensions are lowercased, so both land on pack_archive/clip.mp4
        let files = make_pack(fx.temp_dir.path(), &["clip.MP4", "clip.mp4"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());

        let report = stage.copy_files(&files, &OutputTarget::suffix("archive"), 2);

        assert_eq!(report.succeeded, 1);
        assert!(report.failed[files[1].path()].contains("clip.MP4"));
    }

    #[test]
    fn test_overwrite_replaces_existing_output() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["a.png"]);
        let existing = fx.temp_dir.path().join("pack_archive/a.jxl");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"stale").unwrap();

        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions { overwrite: true });
        let report = stage.transcode(&files, &OutputTarget::suffix("archive"), TargetFormat::Jxl, 1);

        assert_eq!(report.succeeded, 1);
        assert_eq!(fs::read(&existing).unwrap(), b"fake output");
    }

    #[test]
    fn test_missing_output_is_failure_and_batch_continues() {
        let fx = fixture(FakeRunner::new().silent("cjxl"));
        let files = make_pack(fx.temp_dir.path(), &["a.png", "b.png"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());

        let report = stage.transcode(&files, &OutputTarget::suffix("archive"), TargetFormat::Jxl, 2);

        assert_eq!(report.total, 2);
        assert_eq!(report.failed_count(), 2);
        assert_eq!(fx.runner.calls_to("cjxl").len(), 2);
    }

    #[test]
    fn test_jxl_to_png_uses_djxl() {
        assert_eq!(
            operation_for(Path::new("pack/a.JXL"), TargetFormat::Png),
            ToolOperation::DecodeJxl
        );
        assert_eq!(
            operation_for(Path::new("pack/a.png"), TargetFormat::Png),
            ToolOperation::Transcode(TargetFormat::Png)
        );
        assert_eq!(
            operation_for(Path::new("pack/a.jxl"), TargetFormat::Avif),
            ToolOperation::Transcode(TargetFormat::Avif)
        );
    }

    #[test]
    fn test_decode_stage_writes_png_directory() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["a.jxl"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());

        let report = stage.transcode(&files, &OutputTarget::suffix("png"), TargetFormat::Png, 4);

        assert_eq!(report.succeeded, 1);
        assert_eq!(fx.runner.calls_to("djxl").len(), 1);
        assert!(fx.temp_dir.path().join("pack_png/a.png").is_file());
    }

    #[test]
    fn test_copy_files_keeps_extension_and_skips() {
        let fx = fixture(FakeRunner::new());
        let files = make_pack(fx.temp_dir.path(), &["clip.mp4", "still.webp"]);
        let stage = TranscodeStage::new(&fx.invoker, &fx.planner, StageOptions::default());
        let target = OutputTarget::suffix("archive");

        let first = stage.copy_files(&files, &target, 2);
        let second = stage.copy_files(&files, &target, 2);

        assert_eq!(first.succeeded, 2);
        assert_eq!(second.skipped_count(), 2);
        assert_eq!(
            fs::read(fx.temp_dir.path().join("pack_archive/clip.mp4")).unwrap(),
            b"source"
        );
        assert!(fx.runner.calls().is_empty());
    }
}
