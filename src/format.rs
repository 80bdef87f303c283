//! Format classification and target-format naming.
//!
//! Everything here is a pure function of file names: no I/O, no errors.
//! [`classify`] decides which decode path an input takes, [`TargetFormat`]
//! is the user's requested output, and [`output_names`] derives the flat
//! archive entry names.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Camera-manufacturer raw suffixes, lowercase.
pub const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "nef", "nrw", "arw", "srf", "sr2", "raf", "orf", "pef", "rw2", "3fr", "rdc",
    "iiq", "dcr", "k25", "kdc", "mef", "mos", "erf",
];

const HEIC_EXTENSIONS: &[&str] = &["heic", "heif"];

/// Decode path an input file takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Raw,
    Heic,
    Svg,
    /// Anything the `image` crate decodes directly.
    Standard,
}

impl fmt::Display for FormatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FormatClass::Raw => "raw",
            FormatClass::Heic => "heic",
            FormatClass::Svg => "svg",
            FormatClass::Standard => "standard",
        };
        f.write_str(label)
    }
}

/// Lowercased extension of a file name, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Classify a file by its extension (case-insensitive).
pub fn classify(filename: &str) -> FormatClass {
    match extension_of(filename) {
        Some(ext) if RAW_EXTENSIONS.contains(&ext.as_str()) => FormatClass::Raw,
        Some(ext) if HEIC_EXTENSIONS.contains(&ext.as_str()) => FormatClass::Heic,
        Some(ext) if ext == "svg" => FormatClass::Svg,
        _ => FormatClass::Standard,
    }
}

/// The byte-level container an encoder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    Jpeg,
    Png,
    Webp,
    Tiff,
    Svg,
    Psd,
}

impl Container {
    /// Canonical extension, used for intermediates and scratch files.
    pub fn extension(self) -> &'static str {
        match self {
            Container::Jpeg => "jpg",
            Container::Png => "png",
            Container::Webp => "webp",
            Container::Tiff => "tiff",
            Container::Svg => "svg",
            Container::Psd => "psd",
        }
    }
}

/// Requested output format, as spelled by the caller.
///
/// `jpg` and `jpeg` encode identically but keep their own spelling in
/// output names. Anything unrecognised is kept verbatim in [`Other`] and
/// encoded as JPEG.
///
/// [`Other`]: TargetFormat::Other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetFormat {
    Jpg,
    Jpeg,
    Png,
    Webp,
    Tiff,
    Svg,
    Psd,
    Other(String),
}

impl TargetFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" => TargetFormat::Jpg,
            "jpeg" => TargetFormat::Jpeg,
            "png" => TargetFormat::Png,
            "webp" => TargetFormat::Webp,
            "tif" | "tiff" => TargetFormat::Tiff,
            "svg" => TargetFormat::Svg,
            "psd" => TargetFormat::Psd,
            _ => TargetFormat::Other(value.to_string()),
        }
    }

    /// Extension written on output files.
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Jpeg => "jpeg",
            TargetFormat::Other(_) => "jpg",
            other => other.container().extension(),
        }
    }

    /// Container the encoder produces for this target.
    pub fn container(&self) -> Container {
        match self {
            TargetFormat::Jpg | TargetFormat::Jpeg | TargetFormat::Other(_) => Container::Jpeg,
            TargetFormat::Png => Container::Png,
            TargetFormat::Webp => Container::Webp,
            TargetFormat::Tiff => Container::Tiff,
            TargetFormat::Svg => Container::Svg,
            TargetFormat::Psd => Container::Psd,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, TargetFormat::Other(_))
    }
}

impl From<String> for TargetFormat {
    fn from(value: String) -> Self {
        TargetFormat::parse(&value)
    }
}

impl From<TargetFormat> for String {
    fn from(value: TargetFormat) -> Self {
        match value {
            TargetFormat::Other(raw) => raw,
            known => known.extension().to_string(),
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetFormat::Other(raw) => write!(f, "{raw} (as jpg)"),
            known => f.write_str(known.extension()),
        }
    }
}

/// Base name of an uploaded file: directory components and the last
/// extension stripped.
pub fn base_name(original_name: &str) -> String {
    // Uploads from Windows clients may carry backslash-separated paths.
    let last = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_name);
    let stem = Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(last);
    if stem.is_empty() {
        "image".to_string()
    } else {
        stem.to_string()
    }
}

/// Derive flat, unique output names for a batch, in input order.
///
/// Each name is `<base>.<ext>`. A second input with the same base becomes
/// `<base> (1).<ext>`, then `(2)`, and so on.
pub fn output_names<'a, I>(original_names: I, target: &TargetFormat) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let ext = target.extension();
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = Vec::new();

    for original in original_names {
        let base = base_name(original);
        let mut candidate = format!("{base}.{ext}");
        let mut n = 1;
        while taken.contains(&candidate.to_lowercase()) {
            candidate = format!("{base} ({n}).{ext}");
            n += 1;
        }
        taken.insert(candidate.to_lowercase());
        names.push(candidate);
    }
    names
}
