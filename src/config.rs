use crate::defaults;
use crate::error::{FrameBatchError, Result};
use crate::streaming::engine::EngineConfig;
use crate::streaming::model::{DecodingKind, OutputKind};
use crate::streaming::ring_buffer::BufferGeometry;
use crate::streaming::stitcher::{MergeMode, StitcherConfig};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub buffer: BufferConfig,
    pub merge: MergeConfig,
    pub decoding: DecodingConfig,
    pub logging: LoggingConfig,
}

/// Feature window geometry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub feature_count: usize,
    /// Columns in each stream's ring buffer.
    pub window_length: usize,
    /// Columns pushed per step.
    pub frame_length: usize,
    pub pad_value: f32,
    pub normalization_epsilon: f32,
}

/// Token-stream stitching
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub mode: MergeMode,
    pub delay: usize,
    pub tokens_per_chunk: usize,
    pub lcs_delay: Option<usize>,
    pub max_steps_per_timestep: usize,
    pub max_skips_per_row: usize,
    pub blank_id: u32,
}

/// Decoder behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DecodingConfig {
    pub kind: DecodingKind,
    pub stateful: bool,
    pub output: OutputConfig,
}

/// Model output head read by default.
///
/// `output = "single"` or `output = { dual = "ctc" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputConfig {
    #[default]
    Single,
    Dual(String),
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: LogLevel,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to a tracing filter directive string for this crate.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "framebatch=error",
            LogLevel::Warn => "framebatch=warn",
            LogLevel::Info => "framebatch=info",
            LogLevel::Debug => "framebatch=debug",
            LogLevel::Trace => "framebatch=trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = FrameBatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(FrameBatchError::ConfigInvalidValue {
                key: "logging.level".to_string(),
                message: format!("unknown level '{}'", other),
            }),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            feature_count: defaults::FEATURE_COUNT,
            window_length: defaults::WINDOW_LENGTH,
            frame_length: defaults::FRAME_LENGTH,
            pad_value: defaults::PAD_VALUE,
            normalization_epsilon: defaults::NORMALIZATION_EPSILON,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::Middle,
            delay: defaults::DELAY,
            tokens_per_chunk: defaults::TOKENS_PER_CHUNK,
            lcs_delay: None,
            max_steps_per_timestep: defaults::MAX_STEPS_PER_TIMESTEP,
            max_skips_per_row: defaults::MAX_SKIPS_PER_ROW,
            blank_id: defaults::BLANK_ID,
        }
    }
}

impl BufferConfig {
    pub fn geometry(&self) -> BufferGeometry {
        BufferGeometry {
            feature_count: self.feature_count,
            window_length: self.window_length,
            pad_value: self.pad_value,
            epsilon: self.normalization_epsilon,
        }
    }
}

impl MergeConfig {
    pub fn stitcher(&self) -> StitcherConfig {
        StitcherConfig {
            mode: self.mode,
            delay: self.delay,
            tokens_per_chunk: self.tokens_per_chunk,
            lcs_delay: self.lcs_delay,
            max_steps_per_timestep: self.max_steps_per_timestep,
            max_skips_per_row: self.max_skips_per_row,
            blank_id: Some(self.blank_id),
        }
    }
}

impl DecodingConfig {
    pub fn output_kind(&self) -> OutputKind {
        match &self.output {
            OutputConfig::Single => OutputKind::SingleOutput,
            OutputConfig::Dual(key) => OutputKind::DualOutput {
                secondary_key: key.clone(),
            },
        }
    }
}

fn invalid(key: &str, message: &str) -> FrameBatchError {
    FrameBatchError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Check cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<()> {
        let buffer = &self.buffer;
        if buffer.feature_count == 0 {
            return Err(invalid("buffer.feature_count", "must be positive"));
        }
        if buffer.window_length == 0 {
            return Err(invalid("buffer.window_length", "must be positive"));
        }
        if buffer.frame_length == 0 {
            return Err(invalid("buffer.frame_length", "must be positive"));
        }
        if buffer.frame_length > buffer.window_length {
            return Err(invalid(
                "buffer.frame_length",
                "must not exceed buffer.window_length",
            ));
        }
        if buffer.normalization_epsilon.is_nan() || buffer.normalization_epsilon <= 0.0 {
            return Err(invalid("buffer.normalization_epsilon", "must be positive"));
        }
        if self.merge.max_steps_per_timestep == 0 {
            return Err(invalid("merge.max_steps_per_timestep", "must be at least 1"));
        }
        if self.merge.mode == MergeMode::Lcs && self.merge.lcs_delay.is_none() {
            return Err(invalid("merge.lcs_delay", "required when merge.mode = \"lcs\""));
        }
        if let OutputConfig::Dual(key) = &self.decoding.output
            && key.is_empty()
        {
            return Err(invalid("decoding.output", "dual output needs a secondary key"));
        }
        Ok(())
    }

    /// Validated engine settings.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        self.validate()?;
        Ok(EngineConfig {
            geometry: self.buffer.geometry(),
            frame_length: self.buffer.frame_length,
            stitcher: self.merge.stitcher(),
            decoding: self.decoding.kind,
            stateful: self.decoding.stateful,
            output: self.decoding.output_kind(),
        })
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - FRAMEBATCH_MERGE_MODE → merge.mode ("middle" or "lcs")
    /// - FRAMEBATCH_LCS_DELAY → merge.lcs_delay
    /// - FRAMEBATCH_LOG_LEVEL → logging.level
    ///
    /// Empty or unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("FRAMEBATCH_MERGE_MODE")
            && !mode.is_empty()
        {
            match mode.to_ascii_lowercase().as_str() {
                "middle" => self.merge.mode = MergeMode::Middle,
                "lcs" => self.merge.mode = MergeMode::Lcs,
                other => warn!(value = other, "Ignoring unknown FRAMEBATCH_MERGE_MODE"),
            }
        }

        if let Ok(delay) = std::env::var("FRAMEBATCH_LCS_DELAY")
            && !delay.is_empty()
        {
            match delay.parse::<usize>() {
                Ok(delay) => self.merge.lcs_delay = Some(delay),
                Err(e) => warn!(value = %delay, error = %e, "Ignoring invalid FRAMEBATCH_LCS_DELAY"),
            }
        }

        if let Ok(level) = std::env::var("FRAMEBATCH_LOG_LEVEL")
            && !level.is_empty()
        {
            match level.parse::<LogLevel>() {
                Ok(level) => self.logging.level = level,
                Err(e) => warn!(error = %e, "Ignoring invalid FRAMEBATCH_LOG_LEVEL"),
            }
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/framebatch/config.toml on Linux, or `None` when the
    /// platform has no config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("framebatch").join("config.toml"))
    }
}
