//! Decoding inputs into something the encoder can consume.
//!
//! | Input class | Path |
//! |---|---|
//! | RAW | [`raw`]: ordered fallback chain across external engines |
//! | HEIC | [`heic`]: heif-convert to JPEG or PNG |
//! | SVG | [`svg`]: byte passthrough for SVG targets, resvg otherwise |
//! | Standard | the `image` crate, in process |
//!
//! A successful decode is a [`DecodeOutcome`]: either an in-memory bitmap or
//! an intermediate file, tagged with the engine that produced it. Engines that
//! write files do so in a private scratch directory owned by the outcome (or
//! by the failed attempt), so byproducts disappear when it is dropped.

pub mod heic;
pub mod raw;
pub mod svg;

use crate::format::Container;
use crate::tools::{ToolAvailability, ToolError};
use image::{DynamicImage, ImageReader};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

/// Why one strategy attempt failed. Never escapes the chain on its own.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    /// Every strategy in the applicable chain failed (or none was installed).
    #[error("all decoders failed for {file}: {last_error} [tools: {availability}]")]
    Exhausted {
        file: String,
        last_error: String,
        attempts: Vec<String>,
        availability: ToolAvailability,
    },
    #[error("cannot decode {file}: {source}")]
    Image {
        file: String,
        #[source]
        source: image::ImageError,
    },
    #[error("cannot rasterize {file}: {message}")]
    Svg { file: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded image, either in memory or as a file in a known container.
#[derive(Debug)]
pub enum DecodedImage {
    Buffer(DynamicImage),
    File { path: PathBuf, container: Container },
}

impl DecodedImage {
    /// Load into memory. Files in containers the `image` crate cannot read
    /// (SVG, PSD) are an error.
    pub fn load(&self) -> Result<DynamicImage, image::ImageError> {
        match self {
            DecodedImage::Buffer(img) => Ok(img.clone()),
            DecodedImage::File { path, .. } => {
                ImageReader::open(path)?.with_guessed_format()?.decode()
            }
        }
    }

    pub fn container(&self) -> Option<Container> {
        match self {
            DecodedImage::Buffer(_) => None,
            DecodedImage::File { container, .. } => Some(*container),
        }
    }
}

/// A successful decode.
#[derive(Debug)]
pub struct DecodeOutcome {
    pub image: DecodedImage,
    /// Engine label, e.g. `libraw`, `vips`, `image`.
    pub engine: String,
    scratch: Option<TempDir>,
}

impl DecodeOutcome {
    pub fn in_memory(image: DynamicImage, engine: impl Into<String>) -> Self {
        Self {
            image: DecodedImage::Buffer(image),
            engine: engine.into(),
            scratch: None,
        }
    }

    /// A file that lives inside `scratch`; both go away together.
    pub fn scratch_file(
        path: PathBuf,
        container: Container,
        engine: impl Into<String>,
        scratch: TempDir,
    ) -> Self {
        Self {
            image: DecodedImage::File { path, container },
            engine: engine.into(),
            scratch: Some(scratch),
        }
    }

    /// A file not owned by the outcome (e.g. an SVG passed through).
    pub fn borrowed_file(path: PathBuf, container: Container, engine: impl Into<String>) -> Self {
        Self {
            image: DecodedImage::File { path, container },
            engine: engine.into(),
            scratch: None,
        }
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|d| d.path())
    }
}

// ============================================================================
// Strategy chain
// ============================================================================

/// One named decode attempt.
pub struct Strategy<'a> {
    pub name: String,
    attempt: Box<dyn FnOnce() -> Result<DecodeOutcome, AttemptError> + 'a>,
}

impl<'a> Strategy<'a> {
    pub fn new(
        name: impl Into<String>,
        attempt: impl FnOnce() -> Result<DecodeOutcome, AttemptError> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            attempt: Box::new(attempt),
        }
    }
}

/// Run strategies in order and return the first success.
///
/// A failed attempt is logged and the next one runs. When nothing succeeds
/// the error carries every attempt's message plus the availability snapshot.
pub fn first_success<'a>(
    file: &str,
    strategies: impl IntoIterator<Item = Strategy<'a>>,
    availability: &ToolAvailability,
) -> Result<DecodeOutcome, DecodeError> {
    let mut attempts = Vec::new();
    for strategy in strategies {
        debug!(file, engine = %strategy.name, "trying decode strategy");
        match (strategy.attempt)() {
            Ok(outcome) => {
                debug!(file, engine = %strategy.name, "decode strategy succeeded");
                return Ok(outcome);
            }
            Err(e) => {
                warn!(file, engine = %strategy.name, tools = %availability, "decode strategy failed: {e}");
                attempts.push(format!("{}: {e}", strategy.name));
            }
        }
    }
    let last_error = attempts
        .last()
        .cloned()
        .unwrap_or_else(|| "no suitable decoder is installed".to_string());
    Err(DecodeError::Exhausted {
        file: file.to_string(),
        last_error,
        attempts,
        availability: availability.clone(),
    })
}

// ============================================================================
// Scratch staging
// ============================================================================

/// A private directory holding a copy of the input as `input.<ext>`.
///
/// Engines that write byproducts next to their input (dcraw, dcraw_emu)
/// write them here instead of the job directory.
pub struct Staged {
    pub dir: TempDir,
    pub input: PathBuf,
}

/// Stage `input` into a fresh scratch directory under `scratch_root`.
///
/// Hard-links when possible and copies otherwise.
pub fn stage_input(input: &Path, scratch_root: &Path) -> std::io::Result<Staged> {
    let dir = tempfile::Builder::new()
        .prefix(".decode-")
        .tempdir_in(scratch_root)?;
    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_ascii_lowercase();
    let staged = dir.path().join(format!("input.{ext}"));
    if fs::hard_link(input, &staged).is_err() {
        fs::copy(input, &staged)?;
    }
    Ok(Staged {
        dir,
        input: staged,
    })
}

/// Return the first candidate that exists and is non-empty.
pub fn find_output(program: &str, candidates: &[PathBuf]) -> Result<PathBuf, ToolError> {
    for candidate in candidates {
        if fs::metadata(candidate).is_ok_and(|m| m.len() > 0) {
            return Ok(candidate.clone());
        }
    }
    Err(ToolError::MissingOutput {
        program: program.to_string(),
        path: candidates.first().cloned().unwrap_or_default(),
    })
}

/// Decode a standard raster input with the `image` crate.
pub fn decode_standard(input: &Path, file: &str) -> Result<DecodeOutcome, DecodeError> {
    let img = ImageReader::open(input)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| DecodeError::Image {
            file: file.to_string(),
            source,
        })?;
    Ok(DecodeOutcome::in_memory(img, "image"))
}
