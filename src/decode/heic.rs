//! HEIC/HEIF decoding via libheif's `heif-convert`.
//!
//! heif-convert only writes JPEG or PNG. PNG targets get a PNG intermediate;
//! every other target gets a JPEG intermediate that the encoder passes
//! through (JPEG targets) or re-encodes.

use super::{
    AttemptError, DecodeError, DecodeOutcome, Strategy, find_output, first_success, stage_input,
};
use crate::format::{Container, TargetFormat};
use crate::tools::{Tool, ToolRunner, Toolbox};
use std::ffi::OsStr;
use std::path::Path;

/// The heif-convert output container for `target`.
pub fn intermediate_for(target: &TargetFormat) -> Container {
    match target.container() {
        Container::Png => Container::Png,
        _ => Container::Jpeg,
    }
}

pub fn decode_heic<R: ToolRunner>(
    tools: &Toolbox<'_, R>,
    input: &Path,
    file: &str,
    target: &TargetFormat,
    quality: u8,
    scratch_root: &Path,
) -> Result<DecodeOutcome, DecodeError> {
    let container = intermediate_for(target);
    let mut strategies = Vec::new();
    if tools.has(Tool::HeifConvert) {
        strategies.push(Strategy::new(Tool::HeifConvert.label(), move || {
            let staged = stage_input(input, scratch_root)?;
            let dir = staged.dir.path().to_path_buf();
            let out = dir.join(format!("out.{}", container.extension()));
            let quality = quality.to_string();
            let args: [&OsStr; 4] = [
                "-q".as_ref(),
                quality.as_ref(),
                staged.input.as_os_str(),
                out.as_os_str(),
            ];
            tools.run(Tool::HeifConvert, args, &dir)?;
            let path = find_output(Tool::HeifConvert.label(), &[out])?;
            Ok::<_, AttemptError>(DecodeOutcome::scratch_file(
                path,
                container,
                Tool::HeifConvert.label(),
                staged.dir,
            ))
        }));
    }
    first_success(file, strategies, tools.availability)
}
