//! Per-file conversion.
//!
//! Each input walks `Pending → Classifying → Decoding → Encoding → Writing`
//! and ends either `Done` or `Failed` with a placeholder written in its
//! place. Nothing that goes wrong with one file (a typed error, a panic in
//! a codec, a failed write) escapes [`Converter::process`]: the batch always
//! gets exactly one [`ConversionResult`] and one output file per input.
//!
//! ## PSD output
//!
//! PSD is only produced by ImageMagick. When the real conversion fails, the
//! placeholder (PNG) is pushed through the same export; when ImageMagick is
//! absent or fails, the `.psd` entry holds a JPEG card reading
//! "PSD export failed".
//!
//! The input file is removed when processing ends, whatever the outcome.

use crate::batch::InputFile;
use crate::config::ConverterConfig;
use crate::decode::{self, DecodeError, DecodeOutcome, heic, raw::RawDecoder, svg};
use crate::encode::{EncodeError, Encoder};
use crate::format::{FormatClass, TargetFormat, classify};
use crate::placeholder::make_placeholder;
use crate::progress::ProgressTracker;
use crate::tools::{ToolAvailability, ToolRunner, Toolbox};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Where a file is in its conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Pending,
    Classifying,
    Decoding,
    Encoding,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for FileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileStage::Pending => "pending",
            FileStage::Classifying => "classifying",
            FileStage::Decoding => "decoding",
            FileStage::Encoding => "encoding",
            FileStage::Writing => "writing",
            FileStage::Done => "done",
            FileStage::Failed => "failed",
        })
    }
}

/// The result of converting one input. Placeholders carry `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResult {
    pub output_name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

impl ConversionResult {
    pub fn is_placeholder(&self) -> bool {
        self.error.is_some()
    }
}

/// A stage failure, with the message shown on the placeholder.
#[derive(Debug)]
struct Failure {
    stage: FileStage,
    message: String,
    psd_export: bool,
}

impl Failure {
    fn at(stage: FileStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            psd_export: false,
        }
    }
}

impl From<DecodeError> for Failure {
    fn from(e: DecodeError) -> Self {
        Failure::at(FileStage::Decoding, e.to_string())
    }
}

impl From<EncodeError> for Failure {
    fn from(e: EncodeError) -> Self {
        let psd_export = matches!(e, EncodeError::PsdExport(_));
        Failure {
            stage: FileStage::Encoding,
            message: e.to_string(),
            psd_export,
        }
    }
}

struct Converted {
    bytes: Vec<u8>,
    engine: String,
}

/// Removes the input file when dropped.
struct RemoveInput<'a>(&'a Path);

impl Drop for RemoveInput<'_> {
    fn drop(&mut self) {
        match fs::remove_file(self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), "cannot remove input: {e}"),
        }
    }
}

/// Both paths name the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Converts the files of one job.
pub struct Converter<'a, R: ToolRunner> {
    tools: Toolbox<'a, R>,
    config: &'a ConverterConfig,
    work_dir: &'a Path,
}

impl<'a, R: ToolRunner> Converter<'a, R> {
    pub fn new(
        runner: &'a R,
        availability: &'a ToolAvailability,
        config: &'a ConverterConfig,
        work_dir: &'a Path,
    ) -> Self {
        Self {
            tools: Toolbox::new(runner, availability, config.timeouts.tool()),
            config,
            work_dir,
        }
    }

    /// Convert `input` into `<work_dir>/<output_name>` and count it in
    /// `progress`.
    pub fn process(
        &self,
        input: &InputFile,
        output_name: &str,
        target: &TargetFormat,
        progress: &ProgressTracker,
    ) -> ConversionResult {
        let out_path = self.work_dir.join(output_name);
        let result = {
            // An upload stored at its own output path is replaced, not removed.
            let _cleanup = (!same_file(&input.path, &out_path)).then(|| RemoveInput(&input.path));
            self.process_file(input, output_name, target)
        };
        if let Err(e) = progress.complete_one() {
            warn!(file = %input.original_name, "progress update failed: {e}");
        }
        result
    }

    fn process_file(
        &self,
        input: &InputFile,
        output_name: &str,
        target: &TargetFormat,
    ) -> ConversionResult {
        let file = input.original_name.as_str();
        let out_path = self.work_dir.join(output_name);

        let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.convert(input, target)));
        let converted = match attempt {
            Ok(result) => result,
            Err(payload) => Err(Failure::at(
                FileStage::Failed,
                format!("converter panicked: {}", panic_message(payload.as_ref())),
            )),
        };

        let (written, engine, error) = match converted {
            Ok(Converted { bytes, engine }) => match fs::write(&out_path, &bytes) {
                Ok(()) => (true, Some(engine), None),
                Err(e) => {
                    let failure = Failure::at(FileStage::Writing, format!("write failed: {e}"));
                    (self.write_placeholder(file, target, &out_path, &failure), None, Some(failure))
                }
            },
            Err(failure) => (
                self.write_placeholder(file, target, &out_path, &failure),
                None,
                Some(failure),
            ),
        };

        let size = fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            error!(file, output = output_name, written, "output file is empty or missing");
        }

        match &error {
            None => info!(
                file,
                output = output_name,
                engine = engine.as_deref().unwrap_or(""),
                size,
                "converted"
            ),
            Some(failure) => warn!(
                file,
                output = output_name,
                stage = %failure.stage,
                tools = %self.tools.availability,
                "placeholder written: {}",
                failure.message
            ),
        }

        ConversionResult {
            output_name: output_name.to_string(),
            size,
            error: error.map(|f| f.message),
            engine,
        }
    }

    fn convert(&self, input: &InputFile, target: &TargetFormat) -> Result<Converted, Failure> {
        let file = input.original_name.as_str();
        if !input.path.is_file() {
            return Err(Failure::at(
                FileStage::Pending,
                format!("input file not found: {}", input.path.display()),
            ));
        }

        let class = classify(file);
        debug!(file, %class, %target, stage = %FileStage::Classifying, "classified");

        let decoded = self.decode(&input.path, file, class, target)?;
        debug!(file, engine = %decoded.engine, stage = %FileStage::Encoding, "decoded");

        let encoder = Encoder::new(&self.tools, &self.config.encode, self.work_dir);
        let bytes = encoder.encode(&decoded.image, target)?;
        if bytes.is_empty() {
            return Err(Failure::at(FileStage::Encoding, "encoder produced no bytes"));
        }
        Ok(Converted {
            bytes,
            engine: decoded.engine,
        })
    }

    fn decode(
        &self,
        input: &Path,
        file: &str,
        class: FormatClass,
        target: &TargetFormat,
    ) -> Result<DecodeOutcome, DecodeError> {
        match class {
            FormatClass::Raw => {
                RawDecoder::new(&self.tools, self.config, self.work_dir).decode(input, file, target)
            }
            FormatClass::Heic => heic::decode_heic(
                &self.tools,
                input,
                file,
                target,
                self.config.encode.jpeg_quality,
                self.work_dir,
            ),
            FormatClass::Svg => svg::decode_svg(input, file, target),
            FormatClass::Standard => decode::decode_standard(input, file),
        }
    }

    /// Write a placeholder to `out_path`. Returns whether a write succeeded.
    fn write_placeholder(
        &self,
        file: &str,
        target: &TargetFormat,
        out_path: &Path,
        failure: &Failure,
    ) -> bool {
        let bytes = if *target == TargetFormat::Psd {
            self.psd_placeholder(file, failure)
        } else {
            make_placeholder(target, file, &failure.message, &self.config.encode)
        };
        match fs::write(out_path, bytes) {
            Ok(()) => true,
            Err(e) => {
                error!(file, output = %out_path.display(), "cannot write placeholder: {e}");
                false
            }
        }
    }

    /// A PSD placeholder, or a JPEG one announcing that PSD export failed.
    fn psd_placeholder(&self, file: &str, failure: &Failure) -> Vec<u8> {
        let settings = &self.config.encode;
        if !failure.psd_export {
            match self.export_placeholder_psd(file, &failure.message) {
                Ok(psd) => return psd,
                Err(e) => warn!(file, "PSD export of placeholder failed: {e}"),
            }
        }
        warn!(file, "PSD export failed, writing JPEG placeholder with .psd extension");
        let message = format!("PSD export failed: {}", failure.message);
        make_placeholder(&TargetFormat::Jpg, file, &message, settings)
    }

    fn export_placeholder_psd(&self, file: &str, message: &str) -> Result<Vec<u8>, EncodeError> {
        let png = make_placeholder(&TargetFormat::Psd, file, message, &self.config.encode);
        let dir = tempfile::Builder::new()
            .prefix(".placeholder-")
            .tempdir_in(self.work_dir)?;
        let path = dir.path().join("placeholder.png");
        fs::write(&path, png)?;
        Encoder::new(&self.tools, &self.config.encode, self.work_dir).export_psd_file(&path)
    }
}
