//! Converter configuration.
//!
//! Handles loading, validating, and merging `config.toml`. Stock defaults are
//! the base layer; a user file overrides only the keys it names.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [processing]
//! mode = "sequential"        # "sequential" or "parallel"
//! max_workers = 4            # Parallel workers (omit for auto = CPU cores)
//!
//! [timeouts]
//! tool_secs = 120            # Per external-process call
//! probe_secs = 5             # Per availability probe
//! batch_secs = 300           # Whole job
//! probe_cache_secs = 60      # Availability cache lifetime (0 = probe every job)
//!
//! [raw]
//! engine_order = ["libraw", "dcraw", "vips", "magick"]
//! min_jpeg_bytes = 16384     # JPEG results below this are retried via vips
//!
//! [encode]
//! jpeg_quality = 90
//! webp_quality = 90
//! psd_intermediate_quality = 92
//! placeholder_jpeg_quality = 85
//!
//! [limits]
//! max_raw_files = 10
//! max_raw_file_bytes = 524288000
//!
//! [tools]
//! # dcraw = "/usr/local/bin/dcraw"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Converter configuration loaded from `config.toml`.
///
/// All fields have defaults; a config file only needs the values it
/// overrides. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConverterConfig {
    /// Sequential or parallel file processing.
    pub processing: ProcessingConfig,
    /// Per-call, per-probe and per-batch time limits.
    pub timeouts: TimeoutsConfig,
    /// RAW decode chain policy.
    pub raw: RawConfig,
    /// Encoder quality settings.
    pub encode: EncodeConfig,
    /// Defensive job limits.
    pub limits: LimitsConfig,
    /// External program overrides.
    pub tools: ToolPaths,
}

impl ConverterConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let qualities = [
            ("encode.jpeg_quality", self.encode.jpeg_quality),
            ("encode.webp_quality", self.encode.webp_quality),
            (
                "encode.psd_intermediate_quality",
                self.encode.psd_intermediate_quality,
            ),
            (
                "encode.placeholder_jpeg_quality",
                self.encode.placeholder_jpeg_quality,
            ),
        ];
        for (key, value) in qualities {
            if !(1..=100).contains(&value) {
                return Err(ConfigError::Validation(format!("{key} must be 1-100")));
            }
        }
        if self.processing.max_workers == Some(0) {
            return Err(ConfigError::Validation(
                "processing.max_workers must be at least 1".into(),
            ));
        }
        if self.timeouts.tool_secs == 0
            || self.timeouts.probe_secs == 0
            || self.timeouts.batch_secs == 0
        {
            return Err(ConfigError::Validation(
                "timeouts.tool_secs, probe_secs and batch_secs must be non-zero".into(),
            ));
        }
        if self.raw.engine_order.is_empty() {
            return Err(ConfigError::Validation(
                "raw.engine_order must not be empty".into(),
            ));
        }
        let mut seen = Vec::new();
        for engine in &self.raw.engine_order {
            if seen.contains(engine) {
                return Err(ConfigError::Validation(format!(
                    "raw.engine_order lists {engine} twice"
                )));
            }
            seen.push(*engine);
        }
        if self.limits.max_raw_files == 0 {
            return Err(ConfigError::Validation(
                "limits.max_raw_files must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// How files within one batch are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// One file at a time, in input order.
    #[default]
    Sequential,
    /// A bounded worker pool, one task per file.
    Parallel,
}

/// File scheduling settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    pub mode: ProcessingMode,
    /// Maximum number of parallel workers.
    /// When absent, defaults to the number of CPU cores.
    pub max_workers: Option<usize>,
}

/// Resolve the effective worker count for a batch of `files` inputs.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
///
/// Never more workers than files, never fewer than one.
pub fn effective_workers(config: &ProcessingConfig, files: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let wanted = config.max_workers.map(|n| n.min(cores)).unwrap_or(cores);
    wanted.min(files).max(1)
}

/// Time limits, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub tool_secs: u64,
    pub probe_secs: u64,
    pub batch_secs: u64,
    pub probe_cache_secs: u64,
}

impl TimeoutsConfig {
    pub fn tool(&self) -> Duration {
        Duration::from_secs(self.tool_secs)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn batch(&self) -> Duration {
        Duration::from_secs(self.batch_secs)
    }

    pub fn probe_cache(&self) -> Duration {
        Duration::from_secs(self.probe_cache_secs)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            tool_secs: 120,
            probe_secs: 5,
            batch_secs: 300,
            probe_cache_secs: 60,
        }
    }
}

/// External RAW decoding engines, by policy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawEngine {
    /// LibRaw's `dcraw_emu`.
    Libraw,
    /// Dave Coffin's `dcraw`.
    Dcraw,
    /// libvips command line.
    Vips,
    /// ImageMagick.
    Magick,
}

impl std::fmt::Display for RawEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RawEngine::Libraw => "libraw",
            RawEngine::Dcraw => "dcraw",
            RawEngine::Vips => "vips",
            RawEngine::Magick => "magick",
        };
        f.write_str(name)
    }
}

/// RAW decode chain policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    /// Engine priority. ImageMagick only participates in TIFF-producing chains.
    pub engine_order: Vec<RawEngine>,
    /// JPEG results smaller than this are retried once through vips.
    pub min_jpeg_bytes: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            engine_order: vec![
                RawEngine::Libraw,
                RawEngine::Dcraw,
                RawEngine::Vips,
                RawEngine::Magick,
            ],
            min_jpeg_bytes: 16 * 1024,
        }
    }
}

/// Encoder quality settings (1-100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncodeConfig {
    pub jpeg_quality: u8,
    pub webp_quality: u8,
    /// JPEG intermediate handed to the PSD exporter when no TIFF could be made.
    pub psd_intermediate_quality: u8,
    pub placeholder_jpeg_quality: u8,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            webp_quality: 90,
            psd_intermediate_quality: 92,
            placeholder_jpeg_quality: 85,
        }
    }
}

/// Limits re-checked on every job descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_raw_files: usize,
    pub max_raw_file_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_raw_files: 10,
            max_raw_file_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Program overrides. Each value is a bare name looked up on `PATH` or an
/// absolute path. Unset tools use their well-known names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dcraw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dcraw_emu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vips: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magick: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heif_convert: Option<String>,
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    toml::Value::try_from(ConverterConfig::default())
        .map_err(|e| ConfigError::Validation(format!("stock config does not serialize: {e}")))
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<ConverterConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: ConverterConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file. `None` means stock defaults.
pub fn load_config(path: Option<&Path>) -> Result<ConverterConfig, ConfigError> {
    let overlay = match path {
        Some(p) => {
            let content = fs::read_to_string(p)?;
            Some(toml::from_str::<toml::Value>(&content)?)
        }
        None => None,
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# imgconvert configuration
# ========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# File scheduling within a batch
# ---------------------------------------------------------------------------
[processing]
# "sequential" converts files one at a time in input order.
# "parallel" runs one task per file on a bounded worker pool.
mode = "sequential"
# Maximum parallel workers. Omit to use all CPU cores.
# Values above the core count or the batch size are clamped down.
# max_workers = 4

# ---------------------------------------------------------------------------
# Time limits (seconds)
# ---------------------------------------------------------------------------
[timeouts]
# Each external decoder/encoder call. A timeout counts as a failed attempt.
tool_secs = 120
# Each availability probe (e.g. `dcraw -V`).
probe_secs = 5
# The whole batch. On expiry running tools are killed and the job fails.
batch_secs = 300
# How long a tool availability snapshot is reused across jobs. 0 = never.
probe_cache_secs = 60

# ---------------------------------------------------------------------------
# RAW decoding
# ---------------------------------------------------------------------------
[raw]
# Engine priority. Absent engines are skipped.
# ImageMagick is only used when producing TIFF (tiff and psd targets).
engine_order = ["libraw", "dcraw", "vips", "magick"]
# JPEG results smaller than this many bytes are retried once through vips,
# keeping whichever result is larger.
min_jpeg_bytes = 16384

# ---------------------------------------------------------------------------
# Encoder quality (1-100)
# ---------------------------------------------------------------------------
[encode]
jpeg_quality = 90
webp_quality = 90
# JPEG intermediate handed to the PSD exporter when no TIFF could be made.
psd_intermediate_quality = 92
# Failure placeholders delivered as JPEG.
placeholder_jpeg_quality = 85

# ---------------------------------------------------------------------------
# Job limits (re-checked on every job)
# ---------------------------------------------------------------------------
[limits]
max_raw_files = 10
max_raw_file_bytes = 524288000

# ---------------------------------------------------------------------------
# External programs. Bare names are looked up on PATH.
# Defaults: dcraw, dcraw_emu (or libraw_dcraw_emu), vips,
# magick (or convert), heif-convert.
# ---------------------------------------------------------------------------
[tools]
# dcraw = "/usr/local/bin/dcraw"
# dcraw_emu = "libraw_dcraw_emu"
# vips = "vips"
# magick = "convert"
# heif_convert = "heif-convert"
"##
}

// =============================================================================
// Tests
// =============================================================================
