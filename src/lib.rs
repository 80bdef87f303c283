//! # imgconvert
//!
//! Batch image conversion that never loses a file. A job is a list of
//! uploads, a target format and a private work directory; the result is a
//! zip archive with exactly one entry per upload, either the converted image
//! or a placeholder image that says why conversion failed.
//!
//! # Architecture: Per-File Pipeline
//!
//! ```text
//! classify → decode → encode → write      (per file, isolated)
//!      batch: progress.json, worker scheduling, zip, timeout
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`format`] | Extension classification, target formats, output naming |
//! | [`tools`] | External process runner with timeouts and cancellation, tool probing |
//! | [`decode`] | RAW fallback chain, HEIC via heif-convert, SVG via resvg, standard rasters |
//! | [`encode`] | JPEG, PNG, WebP, TIFF, SVG-wrapped raster, PSD via ImageMagick |
//! | [`placeholder`] | Diagnostic images for failed conversions |
//! | [`process`] | One file from input to written output, failures contained |
//! | [`progress`] | Atomically replaced `progress.json` for external pollers |
//! | [`archive`] | Deflate zip of the job's outputs |
//! | [`batch`] | Job descriptor, orchestration, isolated job thread with batch timeout |
//! | [`config`] | `config.toml` loading, merging and validation |
//! | [`output`] | CLI output formatting |
//! | [`logging`] | Tracing subscriber setup |
//!
//! # Design Decisions
//!
//! ## External Engines Behind One Trait
//!
//! Camera RAW has no single decoder that works everywhere, so RAW files go
//! through whichever of dcraw_emu, dcraw, vips and ImageMagick are installed,
//! in a configurable order. Every process call goes through
//! [`tools::ToolRunner`]; tests swap in a scripted runner that writes the
//! files a real tool would, so each fallback path is covered without the
//! tools installed.
//!
//! ## Explicit Decode Results
//!
//! A decode yields either an in-memory bitmap or an intermediate file in a
//! known container ([`decode::DecodedImage`]). Intermediates that already
//! match the target are copied byte for byte; everything else is decoded
//! and re-encoded. Scratch files live in per-attempt temp directories and
//! disappear with the value that owns them.
//!
//! ## Failures Become Images
//!
//! A file that cannot be converted still produces an entry in the archive:
//! a placeholder in the requested format naming the file and the error. Only
//! batch-level problems (bad descriptor, unusable work directory, archive
//! error, timeout) fail the job, and then no archive is produced at all.

pub mod archive;
pub mod batch;
pub mod config;
pub mod decode;
pub mod encode;
pub mod format;
pub mod logging;
pub mod output;
pub mod placeholder;
pub mod process;
pub mod progress;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_helpers;
