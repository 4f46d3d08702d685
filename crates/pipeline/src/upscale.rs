//! Upscale stage: probe, AI upscale, corrective downscale.
//!
//! For each still the stage picks one of two paths:
//!
//! - **downscale only**: the image already meets the target and
//!   `always_upscale` is off, so ffmpeg resizes it straight to the target
//! - **upscale**: the upscaler runs at an integer scale (at most 4), writing a
//!   temp sibling; if the result overshoots the target it is resized to a
//!   second temp sibling which then replaces the first
//!
//! Only finished files are moved to the canonical `png` path.

use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::batch::{run_planned_batch, BatchReport, ItemOutcome};
use crate::format::{TemplateVars, ToolOperation};
use crate::media::{Dimensions, MediaFile, MediaKind};
use crate::path_plan::{ensure_parent_dir, OutputTarget, PathPlanner};
use crate::replace::{discard, discard_all, promote, replace_corrected, temp_sibling};
use crate::tool::{verify_output, ToolInvoker};
use crate::transcode::{check_existing, Existing, StageOptions};

/// Largest factor the upscaler models support
pub const MAX_SCALE: u32 = 4;

/// Default lower bound for the computed scale
pub const DEFAULT_MIN_SCALE: u32 = 2;

/// Model used at the maximum scale
pub const QUALITY_MODEL: &str = "realesrgan-x4plus-anime";

/// Model used below the maximum scale
pub const FAST_MODEL: &str = "realesr-animevideov3";

/// Upscaled images are always written as png
pub const UPSCALE_EXTENSION: &str = "png";

/// Errors that reject a whole stage request before any file is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Requested output size; at least one dimension is set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
    width: Option<u32>,
    height: Option<u32>,
}

impl TargetSize {
    /// `0` means "unconstrained"; both zero is rejected
    pub fn new(width: u32, height: u32) -> Result<Self, StageError> {
        let width = (width > 0).then_some(width);
        let height = (height > 0).then_some(height);
        if width.is_none() && height.is_none() {
            return Err(StageError::InvalidRequest(
                "target width and height are both 0".to_string(),
            ));
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// Every requested dimension is met or exceeded
    pub fn is_met_by(&self, dims: Dimensions) -> bool {
        self.width.map_or(true, |w| dims.width >= w) && self.height.map_or(true, |h| dims.height >= h)
    }

    /// Some requested dimension is exceeded
    pub fn is_overshot_by(&self, dims: Dimensions) -> bool {
        self.width.is_some_and(|w| dims.width > w) || self.height.is_some_and(|h| dims.height > h)
    }

    /// ffmpeg scale filter resizing to this target
    pub fn scale_filter(&self) -> String {
        match (self.width, self.height) {
            (Some(w), Some(h)) => format!("scale={}:{}:force_original_aspect_ratio=increase", w, h),
            (Some(w), None) => format!("scale={}:-1", w),
            (None, Some(h)) => format!("scale=-1:{}", h),
            (None, None) => "scale=iw:ih".to_string(),
        }
    }
}

/// Bounds applied to the computed scale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    min_scale: u32,
}

impl ScalePolicy {
    /// Floor is clamped to `1..=MAX_SCALE`
    pub fn new(min_scale: u32) -> Self {
        Self {
            min_scale: min_scale.clamp(1, MAX_SCALE),
        }
    }

    pub fn min_scale(&self) -> u32 {
        self.min_scale
    }
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SCALE)
    }
}

fn ceil_ratio(target: u32, actual: u32) -> u32 {
    let actual = u64::from(actual.max(1));
    let scale = (u64::from(target) + actual - 1) / actual;
    u32::try_from(scale).unwrap_or(u32::MAX)
}

/// Integer scale needed to reach `target` from `dims`, within the policy bounds
pub fn compute_scale(dims: Dimensions, target: TargetSize, policy: ScalePolicy) -> u32 {
    let by_width = target.width.map(|w| ceil_ratio(w, dims.width));
    let by_height = target.height.map(|h| ceil_ratio(h, dims.height));
    let raw = by_width.into_iter().chain(by_height).max().unwrap_or(1);
    raw.clamp(policy.min_scale, MAX_SCALE)
}

/// Upscaler model for a scale factor
pub fn model_for_scale(scale: u32) -> &'static str {
    if scale == MAX_SCALE {
        QUALITY_MODEL
    } else {
        FAST_MODEL
    }
}

/// What the stage will do with one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscalePlan {
    DownscaleOnly,
    Upscale {
        scale: u32,
        model: &'static str,
        corrective: bool,
    },
}

pub fn plan_upscale(
    dims: Dimensions,
    target: TargetSize,
    policy: ScalePolicy,
    always_upscale: bool,
) -> UpscalePlan {
    if target.is_met_by(dims) && !always_upscale {
        return UpscalePlan::DownscaleOnly;
    }
    let scale = compute_scale(dims, target, policy);
    UpscalePlan::Upscale {
        scale,
        model: model_for_scale(scale),
        corrective: target.is_overshot_by(dims.scaled(scale)),
    }
}

pub struct UpscaleStage<'a> {
    invoker: &'a ToolInvoker,
    planner: &'a PathPlanner,
    options: StageOptions,
    policy: ScalePolicy,
    always_upscale: bool,
}

impl<'a> UpscaleStage<'a> {
    pub fn new(invoker: &'a ToolInvoker, planner: &'a PathPlanner, options: StageOptions) -> Self {
        Self {
            invoker,
            planner,
            options,
            policy: ScalePolicy::default(),
            always_upscale: false,
        }
    }

    pub fn with_policy(mut self, policy: ScalePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the upscaler even on images that already meet the target
    pub fn always_upscale(mut self, enabled: bool) -> Self {
        self.always_upscale = enabled;
        self
    }

    /// Upscale every file to `width` x `height`, writing png under `target`.
    ///
    /// # Arguments
    /// * `files` - Stills to upscale
    /// * `target` - Output directory rule
    /// * `width`, `height` - Target size, `0` = unconstrained
    /// * `concurrency` - Worker count
    ///
    /// # Returns
    /// * `Err(StageError::InvalidRequest)` - both dimensions are 0; nothing ran
    /// * `Ok(BatchReport)` - otherwise, with one outcome per file
    pub fn upscale(
        &self,
        files: &[MediaFile],
        target: &OutputTarget,
        width: u32,
        height: u32,
        concurrency: usize,
    ) -> Result<BatchReport, StageError> {
        let size = TargetSize::new(width, height)?;
        Ok(self.upscale_to(files, target, size, concurrency))
    }

    /// Same as [`UpscaleStage::upscale`] with an already validated size
    pub fn upscale_to(
        &self,
        files: &[MediaFile],
        target: &OutputTarget,
        size: TargetSize,
        concurrency: usize,
    ) -> BatchReport {
        info!(
            files = files.len(),
            workers = concurrency,
            filter = %size.scale_filter(),
            min_scale = self.policy.min_scale(),
            "upscaling"
        );
        run_planned_batch(
            files,
            concurrency,
            |file| self.planner.derive(file.path(), target, UPSCALE_EXTENSION),
            |file, output| self.upscale_one(file, output, size),
        )
    }

    fn upscale_one(&self, file: &MediaFile, output: &Path, size: TargetSize) -> ItemOutcome {
        // Configurable extensions can let animations through; the upscaler takes single frames
        if file.kind() != Some(MediaKind::Still) {
            return ItemOutcome::failed("not a still image");
        }
        match check_existing(output, self.options) {
            Existing::Proceed => {}
            Existing::Skip => return ItemOutcome::Skipped,
            Existing::Fail(reason) => return ItemOutcome::Failed(reason),
        }

        let dims = match self.invoker.probe_dimensions(file.path()) {
            Ok(dims) => dims,
            Err(e) => {
                warn!(input = %file.path().display(), error = %e, "probe failed");
                return ItemOutcome::failed(e.to_string());
            }
        };

        if let Err(e) = ensure_parent_dir(output) {
            return ItemOutcome::failed(format!("cannot create output directory: {}", e));
        }

        let plan = plan_upscale(dims, size, self.policy, self.always_upscale);
        let outcome = match plan {
            UpscalePlan::DownscaleOnly => self.downscale_only(file.path(), output, size),
            UpscalePlan::Upscale {
                scale,
                model,
                corrective,
            } => self.upscale_and_correct(file.path(), output, size, scale, model, corrective),
        };

        if let ItemOutcome::Failed(reason) = &outcome {
            warn!(input = %file.path().display(), dims = %dims, reason = %reason, "upscale failed");
        }
        outcome
    }

    fn downscale_only(&self, input: &Path, output: &Path, target: TargetSize) -> ItemOutcome {
        let resized = temp_sibling(output, "resize");
        if let Err(e) = discard(&resized) {
            return ItemOutcome::failed(e.to_string());
        }
        let vars = downscale_vars(input, &resized, target);
        if let Err(e) = self.invoker.invoke(ToolOperation::Downscale, &vars) {
            discard_all(&[&resized]);
            return ItemOutcome::failed(format!("downscale failed: {}", e));
        }
        if let Err(e) = promote(&resized, output) {
            discard_all(&[&resized]);
            return ItemOutcome::failed(e.to_string());
        }
        finished(output)
    }

    fn upscale_and_correct(
        &self,
        input: &Path,
        output: &Path,
        target: TargetSize,
        scale: u32,
        model: &'static str,
        corrective: bool,
    ) -> ItemOutcome {
        let upscaled = temp_sibling(output, "upscale");
        let resized = temp_sibling(output, "resize");
        // A killed run can leave partial temporaries that would pass verification
        if let Err(e) = discard(&upscaled).and_then(|_| discard(&resized)) {
            return ItemOutcome::failed(e.to_string());
        }
        let vars = TemplateVars::new(input, &upscaled, true)
            .with("scale", scale)
            .with("model", model);
        if let Err(e) = self.invoker.invoke(ToolOperation::Upscale, &vars) {
            discard_all(&[&upscaled]);
            return ItemOutcome::failed(format!("upscaler produced nothing: {}", e));
        }

        if !corrective {
            if let Err(e) = promote(&upscaled, output) {
                discard_all(&[&upscaled]);
                return ItemOutcome::failed(e.to_string());
            }
            return finished(output);
        }

        let vars = downscale_vars(&upscaled, &resized, target);
        if let Err(e) = self.invoker.invoke(ToolOperation::Downscale, &vars) {
            discard_all(&[&upscaled, &resized]);
            return ItemOutcome::failed(format!("corrective downscale failed: {}", e));
        }
        if let Err(e) = replace_corrected(&resized, &upscaled, output) {
            discard_all(&[&upscaled, &resized]);
            return ItemOutcome::failed(e.to_string());
        }
        finished(output)
    }
}

/// Downscale variables; an unconstrained side is `-1` as in ffmpeg's scale filter
fn downscale_vars<'v>(input: &'v Path, output: &'v Path, target: TargetSize) -> TemplateVars<'v> {
    let side = |dim: Option<u32>| dim.map_or_else(|| "-1".to_string(), |v| v.to_string());
    TemplateVars::new(input, output, true)
        .with("filter", target.scale_filter())
        .with("width", side(target.width()))
        .with("height", side(target.height()))
}

fn finished(output: &Path) -> ItemOutcome {
    match verify_output(output) {
        Some(_) => ItemOutcome::Success,
        None => ItemOutcome::failed(format!("{} is missing after upscale", output.display())),
    }
}
