//! Concurrency planning for the pipeline stages
//!
//! Derives per-stage worker counts from the configuration and the CPU core count.

use crate::config::Config;
use crate::format::TargetFormat;

/// Upper bound for automatically derived worker counts
const AUTO_WORKER_CAP: u32 = 4;

/// Worker counts for the two kinds of stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Logical CPU cores available
    pub total_cores: u32,
    /// Workers for transcode and copy stages
    pub transcode_workers: u32,
    /// Workers for the upscale stage (GPU bound)
    pub resize_workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - An explicit non-zero thread count is used unchanged
    /// - `0` derives `min(cores, 4)`
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`ConcurrencyPlan::derive`] with a known core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let total_cores = total_cores.max(1);
        Self {
            total_cores,
            transcode_workers: explicit_or_auto(cfg.threads.transcode, total_cores),
            resize_workers: explicit_or_auto(cfg.threads.resize, total_cores),
        }
    }

    /// Workers for transcoding to `format`, after the per-format cap
    pub fn transcode_workers_for(&self, format: TargetFormat) -> usize {
        format.effective_concurrency(self.transcode_workers as usize)
    }

    pub fn resize_workers(&self) -> usize {
        self.resize_workers.max(1) as usize
    }
}

fn explicit_or_auto(configured: u32, cores: u32) -> u32 {
    if configured > 0 {
        configured
    } else {
        cores.min(AUTO_WORKER_CAP)
    }
}
