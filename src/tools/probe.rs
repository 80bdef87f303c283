//! Tool availability probing.
//!
//! Each known engine is asked for its version (or help) under a short
//! timeout. A zero exit marks the tool present; anything else, including a
//! spawn failure, moves on to the next probe argument or program name.
//! Probing never fails: the worst case is a snapshot with every tool absent.
//!
//! | Tool | Programs tried | Probe args |
//! |---|---|---|
//! | dcraw | `dcraw` | `-V`, then `-h` |
//! | LibRaw | `dcraw_emu`, `libraw_dcraw_emu` | `-V`, then `-h` |
//! | vips | `vips` | `--version` |
//! | ImageMagick | `magick`, `convert` | `-version` |
//! | heif-convert | `heif-convert` | `--version`, then `-h` |
//!
//! Snapshots are cached process-wide for `timeouts.probe_cache_secs`, keyed
//! on the configured program overrides.

use super::{Invocation, ToolRunner};
use crate::config::{ConverterConfig, ToolPaths};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// External engines the converter knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Dcraw,
    LibRaw,
    Vips,
    Magick,
    HeifConvert,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Dcraw,
        Tool::LibRaw,
        Tool::Vips,
        Tool::Magick,
        Tool::HeifConvert,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Tool::Dcraw => "dcraw",
            Tool::LibRaw => "libraw",
            Tool::Vips => "vips",
            Tool::Magick => "magick",
            Tool::HeifConvert => "heif-convert",
        }
    }

    fn default_programs(self) -> &'static [&'static str] {
        match self {
            Tool::Dcraw => &["dcraw"],
            Tool::LibRaw => &["dcraw_emu", "libraw_dcraw_emu"],
            Tool::Vips => &["vips"],
            Tool::Magick => &["magick", "convert"],
            Tool::HeifConvert => &["heif-convert"],
        }
    }

    /// Primary probe argument first, fallback second.
    fn probe_args(self) -> &'static [&'static str] {
        match self {
            Tool::Dcraw | Tool::LibRaw => &["-V", "-h"],
            Tool::Vips => &["--version"],
            Tool::Magick => &["-version"],
            Tool::HeifConvert => &["--version", "-h"],
        }
    }

    fn override_in(self, paths: &ToolPaths) -> Option<&str> {
        match self {
            Tool::Dcraw => paths.dcraw.as_deref(),
            Tool::LibRaw => paths.dcraw_emu.as_deref(),
            Tool::Vips => paths.vips.as_deref(),
            Tool::Magick => paths.magick.as_deref(),
            Tool::HeifConvert => paths.heif_convert.as_deref(),
        }
    }

    /// Program names to try, override first.
    pub fn candidates(self, paths: &ToolPaths) -> Vec<String> {
        match self.override_in(paths) {
            Some(program) => vec![program.to_string()],
            None => self
                .default_programs()
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    fn index(self) -> usize {
        match self {
            Tool::Dcraw => 0,
            Tool::LibRaw => 1,
            Tool::Vips => 2,
            Tool::Magick => 3,
            Tool::HeifConvert => 4,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which engines are usable on this host, and under which program name.
///
/// Immutable once built; passed explicitly to every decode chain in a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolAvailability {
    programs: [Option<String>; 5],
}

impl ToolAvailability {
    /// Every tool absent.
    pub fn none() -> Self {
        Self::default()
    }

    /// Mark `tool` present as `program`.
    pub fn with(mut self, tool: Tool, program: impl Into<String>) -> Self {
        self.programs[tool.index()] = Some(program.into());
        self
    }

    pub fn program(&self, tool: Tool) -> Option<&str> {
        self.programs[tool.index()].as_deref()
    }

    pub fn is_available(&self, tool: Tool) -> bool {
        self.programs[tool.index()].is_some()
    }

    pub fn available_count(&self) -> usize {
        self.programs.iter().filter(|p| p.is_some()).count()
    }
}

/// One-line summary, e.g. `dcraw=yes libraw=no vips=yes magick=yes(convert) heif-convert=no`.
impl fmt::Display for ToolAvailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tool) in Tool::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match self.program(*tool) {
                Some(program) if tool.default_programs().first() == Some(&program) => {
                    write!(f, "{tool}=yes")?
                }
                Some(program) => write!(f, "{tool}=yes({program})")?,
                None => write!(f, "{tool}=no")?,
            }
        }
        Ok(())
    }
}

/// Probe every known tool.
pub fn probe(runner: &impl ToolRunner, paths: &ToolPaths, timeout: Duration) -> ToolAvailability {
    let mut availability = ToolAvailability::none();
    for tool in Tool::ALL {
        if let Some(program) = probe_tool(runner, tool, paths, timeout) {
            availability = availability.with(tool, program);
        }
    }
    debug!(tools = %availability, "probed external tools");
    availability
}

fn probe_tool(
    runner: &impl ToolRunner,
    tool: Tool,
    paths: &ToolPaths,
    timeout: Duration,
) -> Option<String> {
    for program in tool.candidates(paths) {
        for arg in tool.probe_args() {
            let invocation = Invocation::new(program.clone(), timeout).arg(arg);
            match runner.run(&invocation) {
                Ok(()) => return Some(program),
                Err(e) => debug!(tool = %tool, probe = %invocation.command_line(), "probe failed: {e}"),
            }
        }
    }
    None
}

struct CachedProbe {
    paths: ToolPaths,
    taken_at: Instant,
    availability: ToolAvailability,
}

static PROBE_CACHE: Mutex<Option<CachedProbe>> = Mutex::new(None);

/// Probe with the process-wide cache.
///
/// A snapshot is reused while it is younger than `timeouts.probe_cache_secs`
/// and was taken with the same program overrides.
pub fn cached_probe(runner: &impl ToolRunner, config: &ConverterConfig) -> ToolAvailability {
    let ttl = config.timeouts.probe_cache();
    if ttl.is_zero() {
        return probe(runner, &config.tools, config.timeouts.probe());
    }

    let mut cache = PROBE_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = cache.as_ref() {
        if entry.paths == config.tools && entry.taken_at.elapsed() < ttl {
            return entry.availability.clone();
        }
    }

    let availability = probe(runner, &config.tools, config.timeouts.probe());
    *cache = Some(CachedProbe {
        paths: config.tools.clone(),
        taken_at: Instant::now(),
        availability: availability.clone(),
    });
    availability
}
