//! Format registry: target formats, tool operations and command templates.
//!
//! Each external operation is described by a command template such as
//! `cjxl -d 0 -e 8 "{input}" "{output}"`. Templates are tokenized once
//! (whitespace separated, double quotes group) and placeholders are substituted
//! per token afterwards, so paths containing spaces stay a single argument and
//! no shell is involved.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

pub const AVIF_TEMPLATE: &str = r#"ffmpeg -i "{input}" -c:v libsvtav1 -crf 26 -preset 6 -vf "scale=ceil(iw/2)*2:ceil(ih/2)*2" {overwriteFlag} "{output}""#;
pub const JXL_TEMPLATE: &str = r#"cjxl -d 0 -e 8 "{input}" "{output}""#;
pub const PNG_TEMPLATE: &str =
    r#"ffmpeg -i "{input}" -c:v png -compression_level 6 {overwriteFlag} "{output}""#;
pub const WEBP_TEMPLATE: &str =
    r#"ffmpeg -i "{input}" -c:v libwebp -quality 90 {overwriteFlag} "{output}""#;
pub const MP4_TEMPLATE: &str = r#"ffmpeg -i "{input}" -c:v libx264 -c:a copy -crf 22 -preset slow -vf "scale=1920:-2" {overwriteFlag} "{output}""#;
pub const DJXL_TEMPLATE: &str = r#"djxl "{input}" "{output}""#;
pub const PROBE_TEMPLATE: &str = r#"ffprobe -v error -select_streams v:0 -show_entries stream=width,height -of csv=s=x:p=0 "{input}""#;
pub const UPSCALE_TEMPLATE: &str =
    r#"realesrgan-ncnn-vulkan -i "{input}" -o "{output}" -s {scale} -n {model} -f png"#;
pub const DOWNSCALE_TEMPLATE: &str =
    r#"ffmpeg -i "{input}" -vf "{filter}" {overwriteFlag} "{output}""#;

/// Binary that is swapped for a progress-bar wrapper on video encodes.
pub const FFMPEG_BINARY: &str = "ffmpeg";

/// Closed set of output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Avif,
    Jxl,
    Png,
    Webp,
    Mp4,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 5] = [
        TargetFormat::Avif,
        TargetFormat::Jxl,
        TargetFormat::Png,
        TargetFormat::Webp,
        TargetFormat::Mp4,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TargetFormat::Avif => "avif",
            TargetFormat::Jxl => "jxl",
            TargetFormat::Png => "png",
            TargetFormat::Webp => "webp",
            TargetFormat::Mp4 => "mp4",
        }
    }

    /// Output file extension (without the dot)
    pub fn extension(self) -> &'static str {
        self.name()
    }

    pub fn default_template(self) -> &'static str {
        match self {
            TargetFormat::Avif => AVIF_TEMPLATE,
            TargetFormat::Jxl => JXL_TEMPLATE,
            TargetFormat::Png => PNG_TEMPLATE,
            TargetFormat::Webp => WEBP_TEMPLATE,
            TargetFormat::Mp4 => MP4_TEMPLATE,
        }
    }

    /// Encoders that already saturate the machine run one file at a time
    pub fn max_concurrency(self) -> Option<usize> {
        match self {
            TargetFormat::Avif | TargetFormat::Mp4 => Some(1),
            TargetFormat::Jxl | TargetFormat::Png | TargetFormat::Webp => None,
        }
    }

    /// Requested worker count after applying the format cap (at least 1)
    pub fn effective_concurrency(self, requested: usize) -> usize {
        let requested = requested.max(1);
        match self.max_concurrency() {
            Some(cap) => requested.min(cap),
            None => requested,
        }
    }

    /// `png` is an intermediate, never a distribution format
    pub fn is_distribution_format(self) -> bool {
        !matches!(self, TargetFormat::Png)
    }

    /// Video encodes may use a progress-bar wrapper around ffmpeg
    pub fn supports_progress_binary(self) -> bool {
        matches!(self, TargetFormat::Mp4)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown format '{0}' (expected one of avif, jxl, png, webp, mp4)")]
pub struct UnknownFormat(pub String);

impl FromStr for TargetFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().trim_start_matches('.').to_lowercase();
        TargetFormat::ALL
            .into_iter()
            .find(|format| format.name() == normalized)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

/// How success of an external operation is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyRule {
    /// Output file exists and is non-empty; exit code ignored
    OutputArtifact,
    /// Zero exit status and parsable stdout
    ExitStatus,
}

/// Every external operation the pipeline performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolOperation {
    Probe,
    Transcode(TargetFormat),
    DecodeJxl,
    Upscale,
    Downscale,
}

impl ToolOperation {
    pub fn verify_rule(self) -> VerifyRule {
        match self {
            ToolOperation::Probe => VerifyRule::ExitStatus,
            _ => VerifyRule::OutputArtifact,
        }
    }

    /// Name used for the per-operation log file
    pub fn log_name(self) -> String {
        match self {
            ToolOperation::Probe => "probe".to_string(),
            ToolOperation::Transcode(format) => format!("transcode_{}", format),
            ToolOperation::DecodeJxl => "transcode_png".to_string(),
            ToolOperation::Upscale => "upscale".to_string(),
            ToolOperation::Downscale => "downscale".to_string(),
        }
    }

    /// Key accepted in the `[templates]` config table
    pub fn template_key(self) -> &'static str {
        match self {
            ToolOperation::Probe => "probe",
            ToolOperation::Transcode(format) => format.name(),
            ToolOperation::DecodeJxl => "djxl",
            ToolOperation::Upscale => "upscale",
            ToolOperation::Downscale => "downscale",
        }
    }

    pub fn default_template(self) -> &'static str {
        match self {
            ToolOperation::Probe => PROBE_TEMPLATE,
            ToolOperation::Transcode(format) => format.default_template(),
            ToolOperation::DecodeJxl => DJXL_TEMPLATE,
            ToolOperation::Upscale => UPSCALE_TEMPLATE,
            ToolOperation::Downscale => DOWNSCALE_TEMPLATE,
        }
    }

    fn from_template_key(key: &str) -> Option<Self> {
        match key {
            "probe" => Some(ToolOperation::Probe),
            "djxl" => Some(ToolOperation::DecodeJxl),
            "upscale" => Some(ToolOperation::Upscale),
            "downscale" => Some(ToolOperation::Downscale),
            other => other.parse().ok().map(ToolOperation::Transcode),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template is empty")]
    Empty,

    #[error("unterminated quote in template: {0}")]
    UnterminatedQuote(String),

    #[error("unknown template key '{0}'")]
    UnknownKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplateToken {
    text: String,
    quoted: bool,
}

/// A tokenized command template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTemplate {
    tokens: Vec<TemplateToken>,
}

impl ToolTemplate {
    /// Tokenize a template string.
    ///
    /// Whitespace separates tokens except inside double quotes; the quotes
    /// themselves are removed.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_token = false;
        let mut quoted = false;
        let mut in_quotes = false;

        for ch in template.chars() {
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    in_token = true;
                    quoted = true;
                }
                c if c.is_whitespace() && !in_quotes => {
                    if in_token {
                        tokens.push(TemplateToken {
                            text: std::mem::take(&mut current),
                            quoted,
                        });
                        in_token = false;
                        quoted = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            }
        }

        if in_quotes {
            return Err(TemplateError::UnterminatedQuote(template.to_string()));
        }
        if in_token {
            tokens.push(TemplateToken {
                text: current,
                quoted,
            });
        }
        if tokens.is_empty() {
            return Err(TemplateError::Empty);
        }

        Ok(Self { tokens })
    }

    pub fn program(&self) -> &str {
        &self.tokens[0].text
    }

    /// Substitute placeholders and return `(program, args)`.
    ///
    /// Unquoted tokens that become empty (e.g. an empty `{overwriteFlag}`) are
    /// dropped; quoted ones are kept as empty arguments.
    pub fn render(&self, vars: &TemplateVars<'_>) -> (String, Vec<OsString>) {
        let program = vars.substitute(&self.tokens[0].text);
        let args = self.tokens[1..]
            .iter()
            .filter_map(|token| {
                let rendered = vars.substitute(&token.text);
                if rendered.is_empty() && !token.quoted {
                    None
                } else {
                    Some(OsString::from(rendered))
                }
            })
            .collect();
        (program, args)
    }
}

/// Placeholder values for one invocation
#[derive(Debug, Clone)]
pub struct TemplateVars<'a> {
    pub input: &'a Path,
    pub output: Option<&'a Path>,
    pub overwrite: bool,
    extra: Vec<(&'static str, String)>,
}

impl<'a> TemplateVars<'a> {
    pub fn new(input: &'a Path, output: &'a Path, overwrite: bool) -> Self {
        Self {
            input,
            output: Some(output),
            overwrite,
            extra: Vec::new(),
        }
    }

    /// Variables for operations without an output file (probe)
    pub fn input_only(input: &'a Path) -> Self {
        Self {
            input,
            output: None,
            overwrite: false,
            extra: Vec::new(),
        }
    }

    /// Add an extra placeholder such as `scale` or `model`
    pub fn with(mut self, name: &'static str, value: impl ToString) -> Self {
        self.extra.push((name, value.to_string()));
        self
    }

    pub fn overwrite_flag(&self) -> &'static str {
        if self.overwrite {
            "-y"
        } else {
            "-n"
        }
    }

    fn substitute(&self, text: &str) -> String {
        if !text.contains('{') {
            return text.to_string();
        }
        let mut rendered = text
            .replace("{input}", &self.input.to_string_lossy())
            .replace("{overwriteFlag}", self.overwrite_flag());
        if let Some(output) = self.output {
            rendered = rendered.replace("{output}", &output.to_string_lossy());
        }
        for (name, value) in &self.extra {
            rendered = rendered.replace(&format!("{{{}}}", name), value);
        }
        rendered
    }
}

/// Default templates plus the `[templates]` overrides from the config
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    overrides: HashMap<ToolOperation, ToolTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config overrides keyed by format name, `djxl`, `probe`,
    /// `upscale` or `downscale`
    pub fn from_overrides<'a, I>(overrides: I) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut registry = Self::new();
        for (key, template) in overrides {
            let operation = ToolOperation::from_template_key(&key.trim().to_lowercase())
                .ok_or_else(|| TemplateError::UnknownKey(key.clone()))?;
            registry
                .overrides
                .insert(operation, ToolTemplate::parse(template)?);
        }
        Ok(registry)
    }

    pub fn template_for(&self, operation: ToolOperation) -> ToolTemplate {
        match self.overrides.get(&operation) {
            Some(template) => template.clone(),
            None => default_template(operation),
        }
    }

    pub fn is_overridden(&self, operation: ToolOperation) -> bool {
        self.overrides.contains_key(&operation)
    }
}

fn default_template(operation: ToolOperation) -> ToolTemplate {
    // Built-in templates are constants covered by tests
    match ToolTemplate::parse(operation.default_template()) {
        Ok(template) => template,
        Err(_) => ToolTemplate {
            tokens: vec![TemplateToken {
                text: operation.template_key().to_string(),
                quoted: false,
            }],
        },
    }
}
