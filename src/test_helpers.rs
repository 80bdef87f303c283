//! Shared test utilities.
//!
//! Provides synthetic image fixtures and [`ScriptedRunner`], a [`ToolRunner`]
//! whose per-program behaviour is a closure. Scripts stand in for dcraw,
//! vips, ImageMagick and heif-convert by writing the files those tools would
//! write, so every decode chain runs end to end without the tools installed.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let runner = ScriptedRunner::new()
//!     .script("dcraw", dcraw_like(64, 48))
//!     .script("vips", vips_like(64, 48));
//! let availability = probe(&runner, &ToolPaths::default(), Duration::from_secs(1));
//! ```

use crate::tools::{Invocation, ToolError, ToolRunner};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// =========================================================================
// Fixture images
// =========================================================================

/// A deterministic, high-entropy RGB image. Compresses poorly, so JPEGs of
/// it are comfortably large.
pub fn noisy_image(width: u32, height: u32) -> DynamicImage {
    let mut state: u32 = 0x9e37_79b9;
    let img = RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        image::Rgb([r, g, b])
    });
    DynamicImage::ImageRgb8(img)
}

/// A smooth gradient image.
pub fn gradient_image(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    DynamicImage::ImageRgb8(img)
}

/// Write `img` to `path`, format chosen from the extension.
pub fn write_image(path: &Path, img: &DynamicImage) {
    let format = ImageFormat::from_path(path)
        .unwrap_or_else(|_| panic!("no image format for {}", path.display()));
    let img = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    };
    img.save_with_format(path, format)
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
}

pub fn write_png(path: &Path, width: u32, height: u32) {
    write_image(path, &gradient_image(width, height));
}

/// Bytes that no image decoder accepts, standing in for a camera RAW file.
pub fn write_fake_raw(path: &Path) {
    let mut bytes = b"IIRO\x08\x00\x00\x00CR".to_vec();
    bytes.extend((0..4096u32).map(|i| (i.wrapping_mul(31) % 251) as u8));
    std::fs::write(path, bytes).unwrap();
}

pub const SIMPLE_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="120" height="80" viewBox="0 0 120 80"><rect width="120" height="80" fill="#3366cc"/><circle cx="60" cy="40" r="25" fill="#ffcc00"/></svg>"##;

// =========================================================================
// Scripted tool runner
// =========================================================================

type Script = Box<dyn Fn(&Invocation) -> Result<(), ToolError> + Send + Sync>;

/// A [`ToolRunner`] driven by per-program closures.
///
/// Programs without a script behave as not installed. Every invocation is
/// recorded, scripted or not. Uses `Mutex` so it is `Sync` and works with
/// rayon workers.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script<F>(mut self, program: &str, f: F) -> Self
    where
        F: Fn(&Invocation) -> Result<(), ToolError> + Send + Sync + 'static,
    {
        self.scripts.insert(program.to_string(), Box::new(f));
        self
    }

    /// Installed, always exits zero, writes nothing.
    pub fn succeed(self, program: &str) -> Self {
        self.script(program, |_| Ok(()))
    }

    /// Installed, always exits non-zero.
    pub fn fail(self, program: &str) -> Self {
        self.script(program, |inv| {
            if is_probe(inv) {
                Ok(())
            } else {
                Err(ScriptedRunner::exit_error(inv, "scripted failure"))
            }
        })
    }

    pub fn exit_error(inv: &Invocation, stderr: &str) -> ToolError {
        ToolError::Exit {
            program: inv.program.clone(),
            status: "exit code 1".into(),
            stderr: stderr.into(),
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|inv| inv.program == program)
            .collect()
    }

    /// Invocations that were not availability probes.
    pub fn work_invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations_of(program)
            .into_iter()
            .filter(|inv| !is_probe(inv))
            .collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match self.scripts.get(&invocation.program) {
            Some(script) => script(invocation),
            None => Err(ToolError::NotFound {
                program: invocation.program.clone(),
            }),
        }
    }
}

/// Version/help probes carry a single flag argument.
pub fn is_probe(inv: &Invocation) -> bool {
    inv.args.len() == 1
        && matches!(
            inv.arg_strings()[0].as_str(),
            "-V" | "-h" | "--version" | "-version"
        )
}

fn last_arg(inv: &Invocation) -> PathBuf {
    PathBuf::from(inv.args.last().expect("scripted tool called without arguments"))
}

/// Strip a vips option suffix: `out.jpg[Q=90]` → `out.jpg`.
fn strip_vips_options(arg: &Path) -> PathBuf {
    let s = arg.to_string_lossy();
    match s.find('[') {
        Some(i) => PathBuf::from(&s[..i]),
        None => arg.to_path_buf(),
    }
}

/// Behaves like `dcraw -w -T <input>`: writes `<stem>.tiff` next to the input.
pub fn dcraw_like(width: u32, height: u32) -> impl Fn(&Invocation) -> Result<(), ToolError> {
    move |inv| {
        if is_probe(inv) {
            return Ok(());
        }
        let input = last_arg(inv);
        write_image(&input.with_extension("tiff"), &noisy_image(width, height));
        Ok(())
    }
}

/// Behaves like `dcraw_emu -w -T <input>`: writes `<input>.tiff`.
pub fn dcraw_emu_like(width: u32, height: u32) -> impl Fn(&Invocation) -> Result<(), ToolError> {
    move |inv| {
        if is_probe(inv) {
            return Ok(());
        }
        let input = last_arg(inv);
        let mut out = input.into_os_string();
        out.push(".tiff");
        write_image(Path::new(&out), &noisy_image(width, height));
        Ok(())
    }
}

/// Behaves like `vips copy <in> <out>[opts]` (or `heif-convert ... <out>`):
/// writes the last argument in the format its extension names.
pub fn vips_like(width: u32, height: u32) -> impl Fn(&Invocation) -> Result<(), ToolError> {
    move |inv| {
        if is_probe(inv) {
            return Ok(());
        }
        let out = strip_vips_options(&last_arg(inv));
        write_image(&out, &noisy_image(width, height));
        Ok(())
    }
}

/// Like [`vips_like`] but writes a tiny flat image, so JPEG output is small.
pub fn tiny_vips_like() -> impl Fn(&Invocation) -> Result<(), ToolError> {
    move |inv| {
        if is_probe(inv) {
            return Ok(());
        }
        let out = strip_vips_options(&last_arg(inv));
        write_image(&out, &gradient_image(8, 8));
        Ok(())
    }
}

/// Behaves like ImageMagick: writes the last argument. PSD output is a
/// stub beginning with the PSD signature.
pub fn magick_like(width: u32, height: u32) -> impl Fn(&Invocation) -> Result<(), ToolError> {
    move |inv| {
        if is_probe(inv) {
            return Ok(());
        }
        let out = last_arg(inv);
        if out.extension().is_some_and(|e| e == "psd") {
            let mut bytes = b"8BPS\x00\x01".to_vec();
            bytes.resize(1024, 0);
            std::fs::write(&out, bytes).unwrap();
        } else {
            write_image(&out, &noisy_image(width, height));
        }
        Ok(())
    }
}

pub const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const PSD_MAGIC: &[u8] = b"8BPS";

pub fn is_webp(bytes: &[u8]) -> bool {
    bytes.len() > 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

pub fn is_tiff(bytes: &[u8]) -> bool {
    bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*")
}
