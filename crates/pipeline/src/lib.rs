//! Gallery pack preprocessor
//!
//! Batch pipeline that upscales, transcodes and archives directories of
//! images and short videos ("packs") with external tools, one bounded worker
//! pool per stage.

pub mod archive;
pub mod batch;
pub mod concurrency;
pub mod discover;
pub mod format;
pub mod media;
pub mod notify;
pub mod path_plan;
pub mod pipeline;
pub mod replace;
pub mod startup;
pub mod tool;
pub mod transcode;
pub mod upscale;

pub use gallery_prep_config as config;
pub use gallery_prep_config::Config;

pub use archive::{archive_path, ArchiveError, ArchiveFormat, Archiver, SevenZip};
pub use batch::{run_batch, run_planned_batch, BatchItem, BatchReport, ItemOutcome};
pub use concurrency::ConcurrencyPlan;
pub use discover::{fresh_candidates, reprocess_candidates};
pub use format::{TargetFormat, TemplateRegistry, TemplateVars, ToolOperation, ToolTemplate};
pub use media::{list_files, Dimensions, MediaFile, MediaKind};
pub use notify::{notifier_for, DiscordWebhook, NoopNotifier, Notifier, NotifyError};
pub use path_plan::{derive_output_path, OutputTarget, PathPlanner, PathSegments};
pub use pipeline::{
    archiver_from_config, invoker_from_config, ArchiveOutcome, JobKind, PackJob, PackPipeline, PackReport,
    PipelineError, PipelineSettings,
};
pub use startup::{run_preflight, PreflightReport};
pub use tool::{InvokeError, SystemRunner, ToolCommand, ToolInvoker, ToolRunner};
pub use transcode::{StageOptions, TranscodeStage};
pub use upscale::{ScalePolicy, StageError, TargetSize, UpscaleStage};
