//! Encoding decoded images into the requested container.
//!
//! | Container | Encoder | Settings |
//! |---|---|---|
//! | JPEG | `image::codecs::jpeg` | quality `encode.jpeg_quality` (90), baseline only (no progressive mode in `image`) |
//! | PNG | `image::codecs::png` | best compression, adaptive filter |
//! | WebP | `webp` (libwebp) | lossy, quality `encode.webp_quality` (90) |
//! | TIFF | `tiff` | LZW, 8-bit RGB/RGBA |
//! | SVG | PNG + `base64` + `maud` | PNG embedded in a minimal SVG document |
//! | PSD | ImageMagick | 8-bit flattened TIFF intermediate, zip-compressed PSD |
//!
//! Intermediate files already in the target container (a JPEG from vips, an
//! SVG passthrough, a PNG from heif-convert) are returned byte-for-byte.
//!
//! Every failure is a typed [`EncodeError`]. Substituting a placeholder is
//! the per-file processor's job, never the encoder's.

use crate::config::EncodeConfig;
use crate::decode::DecodedImage;
use crate::format::{Container, TargetFormat};
use crate::tools::{Tool, ToolError, ToolRunner, Toolbox};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use maud::html;
use std::ffi::OsStr;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// libwebp's hard limit on either dimension.
const WEBP_MAX_DIMENSION: u32 = 16383;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("TIFF encode failed: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("WebP encode failed: {0}")]
    Webp(String),
    #[error("cannot encode a {0:?} intermediate without decoding it")]
    Undecodable(Container),
    #[error("PSD export failed: {0}")]
    PsdExport(#[source] ToolError),
}

// ============================================================================
// In-memory encoders
// ============================================================================

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut buf, CompressionType::Best, FilterType::Adaptive);
    if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        encoder.write_image(
            rgba.as_raw(),
            rgba.width(),
            rgba.height(),
            ExtendedColorType::Rgba8,
        )?;
    } else {
        let rgb = img.to_rgb8();
        encoder.write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;
    }
    Ok(buf)
}

pub fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = (img.width(), img.height());
    if width > WEBP_MAX_DIMENSION || height > WEBP_MAX_DIMENSION {
        return Err(EncodeError::Webp(format!(
            "{width}x{height} exceeds the {WEBP_MAX_DIMENSION}px WebP limit"
        )));
    }
    let encoded = if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), width, height)
            .encode_simple(false, quality as f32)
            .map(|memory| memory.to_vec())
    } else {
        let rgb = img.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), width, height)
            .encode_simple(false, quality as f32)
            .map(|memory| memory.to_vec())
    };
    encoded.map_err(|e| EncodeError::Webp(format!("{e:?}")))
}

pub fn encode_tiff(img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
    use tiff::encoder::{Compression, TiffEncoder, colortype};

    let mut buf = Vec::new();
    {
        let mut encoder =
            TiffEncoder::new(Cursor::new(&mut buf))?.with_compression(Compression::Lzw);
        if img.color().has_alpha() {
            let rgba = img.to_rgba8();
            encoder.write_image::<colortype::RGBA8>(rgba.width(), rgba.height(), rgba.as_raw())?;
        } else {
            let rgb = img.to_rgb8();
            encoder.write_image::<colortype::RGB8>(rgb.width(), rgb.height(), rgb.as_raw())?;
        }
    }
    Ok(buf)
}

/// Wrap a PNG rendering of `img` in a minimal SVG document.
///
/// This is a raster embedded in SVG, not a vectorization.
pub fn encode_svg_wrapper(img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
    let png = encode_png(img)?;
    let (w, h) = (img.width(), img.height());
    let view_box = format!("0 0 {w} {h}");
    let href = format!("data:image/png;base64,{}", BASE64.encode(png));
    let svg = html! {
        svg xmlns="http://www.w3.org/2000/svg" width=(w) height=(h) viewBox=(view_box) {
            image width=(w) height=(h) href=(href) {}
        }
    };
    Ok(svg.into_string().into_bytes())
}

/// Encode an in-memory image into any container that needs no external tool.
pub fn encode_buffer(
    img: &DynamicImage,
    container: Container,
    settings: &EncodeConfig,
) -> Result<Vec<u8>, EncodeError> {
    match container {
        Container::Jpeg => encode_jpeg(img, settings.jpeg_quality),
        Container::Png => encode_png(img),
        Container::Webp => encode_webp(img, settings.webp_quality),
        Container::Tiff => encode_tiff(img),
        Container::Svg => encode_svg_wrapper(img),
        Container::Psd => Err(EncodeError::PsdExport(ToolError::NotFound {
            program: Tool::Magick.label().to_string(),
        })),
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes decode outcomes for one job, with access to ImageMagick for PSD.
pub struct Encoder<'a, R: ToolRunner> {
    tools: &'a Toolbox<'a, R>,
    settings: &'a EncodeConfig,
    scratch_root: &'a Path,
}

impl<'a, R: ToolRunner> Encoder<'a, R> {
    pub fn new(tools: &'a Toolbox<'a, R>, settings: &'a EncodeConfig, scratch_root: &'a Path) -> Self {
        Self {
            tools,
            settings,
            scratch_root,
        }
    }

    pub fn encode(&self, image: &DecodedImage, target: &TargetFormat) -> Result<Vec<u8>, EncodeError> {
        let container = target.container();
        if let DecodedImage::File { path, container: have } = image {
            if *have == container && passes_through(container) {
                debug!(path = %path.display(), ?container, "passing intermediate through");
                return Ok(fs::read(path)?);
            }
            if container == Container::Psd && matches!(have, Container::Tiff | Container::Jpeg) {
                return self.export_psd_file(path);
            }
            if matches!(have, Container::Svg | Container::Psd) {
                return Err(EncodeError::Undecodable(*have));
            }
        }

        let img = image.load()?;
        match container {
            Container::Psd => self.export_psd(&img),
            other => encode_buffer(&img, other, self.settings),
        }
    }

    /// Write `img` as an 8-bit TIFF and convert it with ImageMagick.
    pub fn export_psd(&self, img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
        let dir = tempfile::Builder::new()
            .prefix(".psd-")
            .tempdir_in(self.scratch_root)?;
        let tiff = dir.path().join("flat.tiff");
        fs::write(&tiff, encode_tiff(img)?)?;
        self.export_psd_file(&tiff)
    }

    /// Convert an intermediate file to PSD with ImageMagick.
    pub fn export_psd_file(&self, intermediate: &Path) -> Result<Vec<u8>, EncodeError> {
        let dir = tempfile::Builder::new()
            .prefix(".psd-")
            .tempdir_in(self.scratch_root)?;
        let out = dir.path().join("out.psd");
        let mut args: Vec<&OsStr> = vec![intermediate.as_os_str()];
        args.extend(
            ["-alpha", "off", "-depth", "8", "-compress", "Zip", "-strip", "-flatten"]
                .iter()
                .map(OsStr::new),
        );
        args.push(out.as_os_str());
        self.tools
            .run(Tool::Magick, args, dir.path())
            .map_err(EncodeError::PsdExport)?;
        let bytes = fs::read(&out).map_err(|_| {
            EncodeError::PsdExport(ToolError::MissingOutput {
                program: Tool::Magick.label().to_string(),
                path: out.clone(),
            })
        })?;
        if bytes.is_empty() {
            return Err(EncodeError::PsdExport(ToolError::MissingOutput {
                program: Tool::Magick.label().to_string(),
                path: out,
            }));
        }
        Ok(bytes)
    }
}

/// Containers whose intermediates are already final output.
fn passes_through(container: Container) -> bool {
    matches!(container, Container::Jpeg | Container::Png | Container::Svg)
}
