//! CLI entry point for the gallery pack preprocessor
//!
//! Parses command line arguments, loads the configuration and runs the pack
//! pipeline over the selected packs.

use clap::{Parser, Subcommand};
use gallery_prep::pipeline::{
    archiver_from_config, invoker_from_config, JobKind, PackJob, PackPipeline, PipelineSettings,
};
use gallery_prep::startup::{self, PreflightReport};
use gallery_prep::tool::{SystemRunner, ToolRunner, PROGRESS_BINARY};
use gallery_prep::{discover, notifier_for, Config};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Config file looked up when `--config` is not given
const DEFAULT_CONFIG: &str = "config.toml";

/// Gallery pack preprocessor - upscale, transcode and archive image packs
#[derive(Parser, Debug)]
#[command(name = "gallery-prep")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file [default: config.toml, optional]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Library root holding the pack directories
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Replace existing outputs instead of skipping them
    #[arg(long, global = true)]
    overwrite: bool,

    /// Append tool output to per-operation log files
    #[arg(long, global = true)]
    logging: bool,

    /// Skip the external tool availability check
    #[arg(long, global = true)]
    skip_checks: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upscale, distribute and archive new packs
    Process {
        /// Pack directories under the root (default: every fresh candidate)
        packs: Vec<PathBuf>,
    },
    /// Rebuild distribution archives from archived packs
    Reprocess {
        /// Pack directories under the root (default: every reprocess candidate)
        packs: Vec<PathBuf>,
    },
    /// List candidate packs without processing them
    List {
        /// List reprocess candidates instead of fresh ones
        #[arg(long)]
        reprocess: bool,
    },
}

/// `RUST_LOG` when set and valid, `info` otherwise; `--verbose` raises the
/// default level to debug on top of either
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let filter = rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    if verbose {
        filter.add_directive(Level::DEBUG.into())
    } else {
        filter
    }
}

fn init_tracing(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, rust_log.as_deref()))
        .init();
}

/// Load the config file, falling back to defaults + environment when the
/// default file is absent. An explicitly given file must exist.
fn load_config(path: Option<&Path>) -> Result<Config, gallery_prep::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG),
        None => {
            info!("no {} found, using defaults", DEFAULT_CONFIG);
            Ok(Config::from_env())
        }
    }
}

fn candidates(root: &Path, kind: JobKind) -> io::Result<Vec<PathBuf>> {
    match kind {
        JobKind::Fresh => discover::fresh_candidates(root),
        JobKind::Reprocess => discover::reprocess_candidates(root),
    }
}

fn list(root: &Path, kind: JobKind) -> ExitCode {
    match candidates(root, kind) {
        Ok(packs) => {
            for pack in packs {
                println!("{}", pack.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(root = %root.display(), error = %e, "cannot read library root");
            ExitCode::FAILURE
        }
    }
}

fn run(root: &Path, config: &Config, packs: Vec<PathBuf>, kind: JobKind, skip_checks: bool) -> ExitCode {
    let settings = match PipelineSettings::from_config(config) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let preflight = if skip_checks {
        info!("skipping tool checks (--skip-checks)");
        PreflightReport {
            missing: Vec::new(),
            progress_binary: startup::is_available(PROGRESS_BINARY),
        }
    } else {
        startup::run_preflight()
    };

    let runner: Arc<dyn ToolRunner> = Arc::new(SystemRunner);
    let invoker = match invoker_from_config(config, runner.clone(), preflight.progress_binary) {
        Ok(invoker) => invoker,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let packs = if packs.is_empty() {
        match candidates(root, kind) {
            Ok(found) => found,
            Err(e) => {
                error!(root = %root.display(), error = %e, "cannot read library root");
                return ExitCode::FAILURE;
            }
        }
    } else {
        packs
    };
    if packs.is_empty() {
        info!(root = %root.display(), "no packs to process");
        return ExitCode::SUCCESS;
    }

    let jobs: Vec<PackJob> = packs
        .into_iter()
        .map(|pack| PackJob { pack, kind })
        .collect();

    info!(
        packs = jobs.len(),
        transcode_workers = settings.concurrency.transcode_workers,
        resize_workers = settings.concurrency.resize_workers,
        format = %settings.dist_format,
        "starting"
    );

    let pipeline = PackPipeline::new(
        root,
        settings,
        invoker,
        Box::new(archiver_from_config(config, runner)),
        notifier_for(&config.notify.webhook),
    );

    let mut failed = false;
    for (job, result) in jobs.iter().zip(pipeline.run_all(&jobs)) {
        match result {
            Ok(report) => {
                failed |= report.has_failures();
                println!("{}", report.title());
                for (stage, batch) in &report.stages {
                    println!("  {}: {}", stage, batch);
                }
                for note in &report.notes {
                    println!("  note: {}", note);
                }
            }
            Err(e) => {
                failed = true;
                eprintln!("{}: {}", job.pack.display(), e);
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn main() -> ExitCode {
    let Args {
        config,
        root,
        overwrite,
        logging,
        skip_checks,
        verbose,
        command,
    } = Args::parse();

    init_tracing(verbose);

    let mut config = match load_config(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    config.general.overwrite |= overwrite;
    config.general.logging |= logging;

    match command {
        Command::List { reprocess } => {
            let kind = if reprocess {
                JobKind::Reprocess
            } else {
                JobKind::Fresh
            };
            list(&root, kind)
        }
        Command::Process { packs } => run(&root, &config, packs, JobKind::Fresh, skip_checks),
        Command::Reprocess { packs } => run(&root, &config, packs, JobKind::Reprocess, skip_checks),
    }
}
