//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Flags that apply to every stage of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Replace outputs that already exist (default false)
    #[serde(default)]
    pub overwrite: bool,
    /// Append external tool output to per-operation log files (default false)
    #[serde(default)]
    pub logging: bool,
    /// Directory receiving the per-operation log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Remove the `<pack>_upscaled` directory once distribution files exist
    #[serde(default)]
    pub cleanup_upscaled: bool,
    /// Package archives even when a stage feeding them reported failures
    #[serde(default)]
    pub archive_on_failure: bool,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            overwrite: false,
            logging: false,
            log_dir: default_log_dir(),
            cleanup_upscaled: false,
            archive_on_failure: false,
        }
    }
}

/// Worker counts per stage family
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ThreadsConfig {
    /// Transcode workers (0 = auto-derive)
    #[serde(default)]
    pub transcode: u32,
    /// Upscale/resize workers (0 = auto-derive)
    #[serde(default)]
    pub resize: u32,
}

/// Distribution (lossy) output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionConfig {
    /// Distribution format name: avif, jxl, webp or mp4
    #[serde(default = "default_dist_format")]
    pub format: String,
    /// Target width in pixels (0 = unconstrained)
    #[serde(default = "default_dist_width")]
    pub width: u32,
    /// Target height in pixels (0 = unconstrained)
    #[serde(default)]
    pub height: u32,
}

fn default_dist_format() -> String {
    "avif".to_string()
}

fn default_dist_width() -> u32 {
    2500
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            format: default_dist_format(),
            width: default_dist_width(),
            height: 0,
        }
    }
}

/// AI upscaling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpscaleConfig {
    /// Run the upscaler even when the source already meets the target
    #[serde(default)]
    pub always_upscale: bool,
    /// Smallest scale factor handed to the upscaler (1 or 2)
    #[serde(default = "default_min_scale")]
    pub min_scale: u32,
    /// Extensions of still images that go through the upscaler
    #[serde(default = "default_upscale_extensions")]
    pub extensions: Vec<String>,
}

fn default_min_scale() -> u32 {
    2
}

fn default_upscale_extensions() -> Vec<String> {
    [".png", ".jpg", ".jpeg", ".webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            always_upscale: false,
            min_scale: default_min_scale(),
            extensions: default_upscale_extensions(),
        }
    }
}

/// Notification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NotifyConfig {
    /// Discord webhook URL (empty = notifications disabled)
    #[serde(default)]
    pub webhook: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub threads: ThreadsConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub upscale: UpscaleConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Command template overrides keyed by format name
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

/// Parse a boolean environment value
///
/// Accepts "true", "1", "yes" as true and "false", "0", "no" as false.
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - GALLERY_PREP_OVERWRITE -> general.overwrite
    /// - GALLERY_PREP_LOGGING -> general.logging
    /// - GALLERY_PREP_WEBHOOK -> notify.webhook
    /// - GALLERY_PREP_DIST_FORMAT -> distribution.format
    /// - GALLERY_PREP_DIST_WIDTH -> distribution.width
    /// - GALLERY_PREP_DIST_HEIGHT -> distribution.height
    /// - GALLERY_PREP_TRANSCODE_THREADS -> threads.transcode
    /// - GALLERY_PREP_RESIZE_THREADS -> threads.resize
    pub fn apply_env_overrides(&mut self) {
        if let Some(flag) = env::var("GALLERY_PREP_OVERWRITE")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            self.general.overwrite = flag;
        }

        if let Some(flag) = env::var("GALLERY_PREP_LOGGING")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            self.general.logging = flag;
        }

        if let Ok(val) = env::var("GALLERY_PREP_WEBHOOK") {
            self.notify.webhook = val;
        }

        if let Ok(val) = env::var("GALLERY_PREP_DIST_FORMAT") {
            if !val.trim().is_empty() {
                self.distribution.format = val.trim().to_lowercase();
            }
        }

        if let Ok(val) = env::var("GALLERY_PREP_DIST_WIDTH") {
            if let Ok(width) = val.parse::<u32>() {
                self.distribution.width = width;
            }
        }

        if let Ok(val) = env::var("GALLERY_PREP_DIST_HEIGHT") {
            if let Ok(height) = val.parse::<u32>() {
                self.distribution.height = height;
            }
        }

        if let Ok(val) = env::var("GALLERY_PREP_TRANSCODE_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.threads.transcode = threads;
            }
        }

        if let Ok(val) = env::var("GALLERY_PREP_RESIZE_THREADS") {
            if let Ok(threads) = val.parse::<u32>() {
                self.threads.resize = threads;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    ///
    /// Used when no configuration file is present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
