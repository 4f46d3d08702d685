//! Pack pipeline: runs the stages for one pack, gates packaging and notifies.
//!
//! Fresh packs:
//!
//! 1. `upscale` stills into `<pack>_upscaled`
//! 2. `dist-images` from `<pack>_upscaled` into `<pack>_dist`
//! 3. `dist-animations` from `<pack>` into `<pack>_dist`
//! 4. optional removal of `<pack>_upscaled`
//! 5. `archive-images` into `<pack>_archive` as jxl
//! 6. `archive-copy` of already-compressed media into `<pack>_archive`
//! 7. `<pack>_archive` -> `<pack>.7z`, `<pack>_dist` -> `<pack>.zip`
//!
//! Reprocessed packs decode their jxl files into `<pack>_png` first and then
//! go through upscale and distribution again, ending with `<pack>.zip`.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::archive::{archive_path, ArchiveFormat, Archiver, SevenZip};
use crate::batch::BatchReport;
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::format::{TargetFormat, TemplateError, TemplateRegistry, UnknownFormat};
use crate::media::{
    list_files, MediaFile, ARCHIVE_COPY_EXTENSIONS, ARCHIVE_IMAGE_EXTENSIONS,
    DIST_ANIMATION_EXTENSIONS,
};
use crate::notify::{notify_best_effort, Notifier};
use crate::path_plan::{OutputTarget, PathPlanner};
use crate::tool::{ToolInvoker, ToolRunner};
use crate::transcode::{StageOptions, TranscodeStage};
use crate::upscale::{ScalePolicy, StageError, TargetSize, UpscaleStage, UPSCALE_EXTENSION};

pub const DECODE_STAGE: &str = "decode";
pub const UPSCALE_STAGE: &str = "upscale";
pub const DIST_IMAGES_STAGE: &str = "dist-images";
pub const DIST_ANIMATIONS_STAGE: &str = "dist-animations";
pub const ARCHIVE_IMAGES_STAGE: &str = "archive-images";
pub const ARCHIVE_COPY_STAGE: &str = "archive-copy";

const ARCHIVE_VARIANT: &str = "archive";
const DIST_VARIANT: &str = "dist";
const UPSCALED_VARIANT: &str = "upscaled";
const PNG_VARIANT: &str = "png";

/// Failed items listed per stage in a notification
const MAX_LISTED_FAILURES: usize = 10;

/// Error type for pipeline setup and pack runs
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pack directory {} does not exist", .0.display())]
    PackMissing(PathBuf),

    #[error(transparent)]
    UnknownFormat(#[from] UnknownFormat),

    #[error("{0} cannot be used as the distribution format")]
    NotDistributable(TargetFormat),

    #[error(transparent)]
    InvalidRequest(#[from] StageError),

    #[error("invalid command template: {0}")]
    Template(#[from] TemplateError),
}

/// Everything the stages need from the configuration, validated up front
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub stage: StageOptions,
    pub dist_format: TargetFormat,
    pub dist_size: TargetSize,
    pub scale_policy: ScalePolicy,
    pub always_upscale: bool,
    pub upscale_extensions: Vec<String>,
    pub cleanup_upscaled: bool,
    pub archive_on_failure: bool,
    pub concurrency: ConcurrencyPlan,
}

impl PipelineSettings {
    /// Validate the configuration
    ///
    /// # Errors
    /// - unknown distribution format, or `png`
    /// - distribution width and height both 0
    pub fn from_config(cfg: &Config) -> Result<Self, PipelineError> {
        let dist_format: TargetFormat = cfg.distribution.format.parse()?;
        if !dist_format.is_distribution_format() {
            return Err(PipelineError::NotDistributable(dist_format));
        }

        Ok(Self {
            stage: StageOptions {
                overwrite: cfg.general.overwrite,
            },
            dist_format,
            dist_size: TargetSize::new(cfg.distribution.width, cfg.distribution.height)?,
            scale_policy: ScalePolicy::new(cfg.upscale.min_scale),
            always_upscale: cfg.upscale.always_upscale,
            upscale_extensions: cfg.upscale.extensions.clone(),
            cleanup_upscaled: cfg.general.cleanup_upscaled,
            archive_on_failure: cfg.general.archive_on_failure,
            concurrency: ConcurrencyPlan::derive(cfg),
        })
    }
}

/// Build the tool invoker described by the configuration
pub fn invoker_from_config(
    cfg: &Config,
    runner: Arc<dyn ToolRunner>,
    progress_binary: bool,
) -> Result<ToolInvoker, PipelineError> {
    let templates = TemplateRegistry::from_overrides(&cfg.templates)?;
    let mut invoker = ToolInvoker::new(runner, templates).with_progress_binary(progress_binary);
    if cfg.general.logging {
        invoker = invoker.with_log_dir(&cfg.general.log_dir);
    }
    Ok(invoker)
}

/// Build the 7z archiver; shares the tool log directory when logging is on
pub fn archiver_from_config(cfg: &Config, runner: Arc<dyn ToolRunner>) -> SevenZip {
    let archiver = SevenZip::new(runner);
    if cfg.general.logging {
        archiver.with_log_dir(&cfg.general.log_dir)
    } else {
        archiver
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Fresh,
    Reprocess,
}

/// One pack to run, relative to the library root (or absolute)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackJob {
    pub pack: PathBuf,
    pub kind: JobKind,
}

impl PackJob {
    pub fn fresh(pack: impl Into<PathBuf>) -> Self {
        Self {
            pack: pack.into(),
            kind: JobKind::Fresh,
        }
    }

    pub fn reprocess(pack: impl Into<PathBuf>) -> Self {
        Self {
            pack: pack.into(),
            kind: JobKind::Reprocess,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created(PathBuf),
    Failed(String),
    /// Not packaged because a feeding stage had failures
    HeldBack(String),
    /// The source directory was never created
    Empty,
}

/// Everything that happened to one pack
#[derive(Debug, Clone, PartialEq)]
pub struct PackReport {
    pub pack: String,
    pub kind: JobKind,
    /// Stage reports in execution order, one entry per stage name
    pub stages: Vec<(String, BatchReport)>,
    pub archives: Vec<(PathBuf, ArchiveOutcome)>,
    pub notes: Vec<String>,
}

impl PackReport {
    pub fn new(pack: impl Into<String>, kind: JobKind) -> Self {
        Self {
            pack: pack.into(),
            kind,
            stages: Vec::new(),
            archives: Vec::new(),
            notes: Vec::new(),
        }
    }

    /// Add a stage report, merging with an earlier one of the same name
    pub fn record_stage(&mut self, name: &str, report: BatchReport) {
        info!(pack = %self.pack, stage = name, summary = %report, "stage finished");
        match self.stages.iter_mut().find(|(stage, _)| stage == name) {
            Some((_, existing)) => existing.merge(report),
            None => self.stages.push((name.to_string(), report)),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&BatchReport> {
        self.stages
            .iter()
            .find(|(stage, _)| stage == name)
            .map(|(_, report)| report)
    }

    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        warn!(pack = %self.pack, note = %note, "pack note");
        self.notes.push(note);
    }

    pub fn failed_items(&self) -> usize {
        self.stages.iter().map(|(_, r)| r.failed_count()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_items() > 0
            || self
                .archives
                .iter()
                .any(|(_, outcome)| matches!(outcome, ArchiveOutcome::Failed(_)))
    }

    pub fn title(&self) -> String {
        let verb = match self.kind {
            JobKind::Fresh => "processed",
            JobKind::Reprocess => "reprocessed",
        };
        if self.has_failures() {
            format!("{} {} with failures", self.pack, verb)
        } else {
            format!("{} {}", self.pack, verb)
        }
    }

    pub fn description(&self) -> String {
        let mut text = String::new();
        for (name, report) in &self.stages {
            let _ = writeln!(text, "**{}**: {}", name, report);
            for (path, reason) in report.failed.iter().take(MAX_LISTED_FAILURES) {
                let file = path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
                let _ = writeln!(text, "- {}: {}", file, reason);
            }
            if report.failed_count() > MAX_LISTED_FAILURES {
                let _ = writeln!(
                    text,
                    "- ... {} more",
                    report.failed_count() - MAX_LISTED_FAILURES
                );
            }
        }
        for (archive, outcome) in &self.archives {
            let name = archive.file_name().map(|f| f.to_string_lossy()).unwrap_or_default();
            let status = match outcome {
                ArchiveOutcome::Created(_) => "created".to_string(),
                ArchiveOutcome::Failed(reason) => format!("failed: {}", reason),
                ArchiveOutcome::HeldBack(reason) => format!("held back: {}", reason),
                ArchiveOutcome::Empty => "nothing to archive".to_string(),
            };
            let _ = writeln!(text, "{}: {}", name, status);
        }
        for note in &self.notes {
            let _ = writeln!(text, "note: {}", note);
        }
        text.trim_end().to_string()
    }
}

/// Locations derived from one pack directory
struct PackContext {
    base: PathBuf,
    name: String,
    pack_dir: PathBuf,
    planner: PathPlanner,
}

impl PackContext {
    fn variant_dir(&self, variant: &str) -> PathBuf {
        self.base.join(format!("{}_{}", self.name, variant))
    }

    fn variant_root(&self, variant: &str) -> OutputTarget {
        OutputTarget::root(format!("{}_{}", self.name, variant))
    }
}

pub struct PackPipeline {
    root: PathBuf,
    settings: PipelineSettings,
    invoker: ToolInvoker,
    archiver: Box<dyn Archiver>,
    notifier: Box<dyn Notifier>,
}

impl PackPipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: PipelineSettings,
        invoker: ToolInvoker,
        archiver: Box<dyn Archiver>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            root: root.into(),
            settings,
            invoker,
            archiver,
            notifier,
        }
    }

    /// Run every job in order; a failing pack never stops the next one
    pub fn run_all(&self, jobs: &[PackJob]) -> Vec<Result<PackReport, PipelineError>> {
        jobs.iter()
            .map(|job| {
                let result = self.run(job);
                if let Err(e) = &result {
                    warn!(pack = %job.pack.display(), error = %e, "pack skipped");
                }
                result
            })
            .collect()
    }

    /// Run all stages for one pack and send the notification
    pub fn run(&self, job: &PackJob) -> Result<PackReport, PipelineError> {
        let ctx = self.context(&job.pack)?;
        info!(pack = %ctx.name, kind = ?job.kind, "processing pack");

        let mut report = PackReport::new(ctx.name.clone(), job.kind);
        match job.kind {
            JobKind::Fresh => self.run_fresh(&ctx, &mut report),
            JobKind::Reprocess => self.run_reprocess(&ctx, &mut report),
        }

        info!(
            pack = %ctx.name,
            failed = report.failed_items(),
            archives = report.archives.len(),
            "pack finished"
        );
        notify_best_effort(self.notifier.as_ref(), &report.title(), &report.description());
        Ok(report)
    }

    fn context(&self, pack: &Path) -> Result<PackContext, PipelineError> {
        let pack_dir = self.root.join(pack);
        let missing = || PipelineError::PackMissing(pack_dir.clone());
        if !pack_dir.is_dir() {
            return Err(missing());
        }
        let name = pack_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(missing)?;
        let base = pack_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(PackContext {
            planner: PathPlanner::with_base(&base),
            base,
            name,
            pack_dir,
        })
    }

    fn transcoder<'a>(&'a self, ctx: &'a PackContext) -> TranscodeStage<'a> {
        TranscodeStage::new(&self.invoker, &ctx.planner, self.settings.stage)
    }

    fn run_fresh(&self, ctx: &PackContext, report: &mut PackReport) {
        let stills = list_files(&ctx.pack_dir, self.settings.upscale_extensions.as_slice(), true);
        self.upscale(ctx, &stills, OutputTarget::suffix(UPSCALED_VARIANT), report);
        self.distribute(ctx, report);
        self.cleanup_upscaled(ctx, report);

        let images = list_files(&ctx.pack_dir, ARCHIVE_IMAGE_EXTENSIONS, true);
        let archived = self.transcoder(ctx).transcode(
            &images,
            &OutputTarget::suffix(ARCHIVE_VARIANT),
            TargetFormat::Jxl,
            self.settings.concurrency.transcode_workers_for(TargetFormat::Jxl),
        );
        report.record_stage(ARCHIVE_IMAGES_STAGE, archived);

        let compressed = list_files(&ctx.pack_dir, ARCHIVE_COPY_EXTENSIONS, true);
        let copied = self.transcoder(ctx).copy_files(
            &compressed,
            &OutputTarget::suffix(ARCHIVE_VARIANT),
            self.settings.concurrency.transcode_workers as usize,
        );
        report.record_stage(ARCHIVE_COPY_STAGE, copied);

        self.package(
            ctx,
            report,
            ARCHIVE_VARIANT,
            ArchiveFormat::SevenZip,
            &[ARCHIVE_IMAGES_STAGE, ARCHIVE_COPY_STAGE],
            archive_whitelist(),
        );
        self.package(
            ctx,
            report,
            DIST_VARIANT,
            ArchiveFormat::Zip,
            &[UPSCALE_STAGE, DIST_IMAGES_STAGE, DIST_ANIMATIONS_STAGE],
            self.dist_whitelist(),
        );
    }

    fn run_reprocess(&self, ctx: &PackContext, report: &mut PackReport) {
        let archived = list_files(&ctx.pack_dir, &[".jxl"], true);
        let decoded = self.transcoder(ctx).transcode(
            &archived,
            &OutputTarget::suffix(PNG_VARIANT),
            TargetFormat::Png,
            self.settings.concurrency.transcode_workers_for(TargetFormat::Png),
        );
        report.record_stage(DECODE_STAGE, decoded);

        let stills = list_files(
            &ctx.variant_dir(PNG_VARIANT),
            self.settings.upscale_extensions.as_slice(),
            true,
        );
        self.upscale(ctx, &stills, ctx.variant_root(UPSCALED_VARIANT), report);
        self.distribute(ctx, report);

        self.package(
            ctx,
            report,
            DIST_VARIANT,
            ArchiveFormat::Zip,
            &[DECODE_STAGE, UPSCALE_STAGE, DIST_IMAGES_STAGE, DIST_ANIMATIONS_STAGE],
            self.dist_whitelist(),
        );
        self.cleanup_upscaled(ctx, report);
    }

    fn upscale(
        &self,
        ctx: &PackContext,
        stills: &[MediaFile],
        target: OutputTarget,
        report: &mut PackReport,
    ) {
        let upscaled = UpscaleStage::new(&self.invoker, &ctx.planner, self.settings.stage)
            .with_policy(self.settings.scale_policy)
            .always_upscale(self.settings.always_upscale)
            .upscale_to(
                stills,
                &target,
                self.settings.dist_size,
                self.settings.concurrency.resize_workers(),
            );
        report.record_stage(UPSCALE_STAGE, upscaled);
    }

    /// `dist-images` and `dist-animations`
    fn distribute(&self, ctx: &PackContext, report: &mut PackReport) {
        let format = self.settings.dist_format;
        let upscaled = list_files(&ctx.variant_dir(UPSCALED_VARIANT), &[UPSCALE_EXTENSION], true);
        let images = self.transcoder(ctx).transcode(
            &upscaled,
            &ctx.variant_root(DIST_VARIANT),
            format,
            self.settings.concurrency.transcode_workers_for(format),
        );
        report.record_stage(DIST_IMAGES_STAGE, images);

        let clips = list_files(&ctx.pack_dir, DIST_ANIMATION_EXTENSIONS, true);
        let animations = self.transcoder(ctx).transcode(
            &clips,
            &OutputTarget::suffix(DIST_VARIANT),
            TargetFormat::Mp4,
            self.settings.concurrency.transcode_workers_for(TargetFormat::Mp4),
        );
        report.record_stage(DIST_ANIMATIONS_STAGE, animations);
    }

    fn cleanup_upscaled(&self, ctx: &PackContext, report: &mut PackReport) {
        if !self.settings.cleanup_upscaled {
            return;
        }
        let dir = ctx.variant_dir(UPSCALED_VARIANT);
        if !dir.is_dir() {
            return;
        }
        // Upscaled files are the only input of dist-images; keep them for a rerun
        if report.stage(DIST_IMAGES_STAGE).is_some_and(BatchReport::has_failures) {
            report.note(format!(
                "kept {} because dist-images had failures",
                dir.display()
            ));
            return;
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => info!(dir = %dir.display(), "removed upscaled directory"),
            Err(e) => report.note(format!("could not remove {}: {}", dir.display(), e)),
        }
    }

    fn package(
        &self,
        ctx: &PackContext,
        report: &mut PackReport,
        variant: &str,
        format: ArchiveFormat,
        feeding: &[&str],
        whitelist: Vec<String>,
    ) {
        let source = ctx.variant_dir(variant);
        let dest = ctx.base.join(&ctx.name);
        let archive = archive_path(&dest, format);

        let failing: Vec<&str> = feeding
            .iter()
            .copied()
            .filter(|stage| report.stage(stage).is_some_and(BatchReport::has_failures))
            .collect();
        if !failing.is_empty() && !self.settings.archive_on_failure {
            let reason = format!("failures in {}", failing.join(", "));
            report.note(format!(
                "{} not created: {}",
                archive.display(),
                reason
            ));
            report.archives.push((archive, ArchiveOutcome::HeldBack(reason)));
            return;
        }

        if !source.is_dir() {
            info!(source = %source.display(), "nothing to archive");
            report.archives.push((archive, ArchiveOutcome::Empty));
            return;
        }

        let outcome = match self.archiver.compress(&source, &dest, format, &whitelist) {
            Ok(path) => ArchiveOutcome::Created(path),
            Err(e) => {
                warn!(source = %source.display(), error = %e, "archiving failed");
                ArchiveOutcome::Failed(e.to_string())
            }
        };
        report.archives.push((archive, outcome));
    }

    fn dist_whitelist(&self) -> Vec<String> {
        let mut whitelist = vec![format!("*.{}", self.settings.dist_format.extension())];
        let video = format!("*.{}", TargetFormat::Mp4.extension());
        if !whitelist.contains(&video) {
            whitelist.push(video);
        }
        whitelist
    }
}

fn archive_whitelist() -> Vec<String> {
    std::iter::once(TargetFormat::Jxl.extension())
        .chain(ARCHIVE_COPY_EXTENSIONS.iter().map(|ext| ext.trim_start_matches('.')))
        .map(|ext| format!("*.{}", ext))
        .collect()
}
