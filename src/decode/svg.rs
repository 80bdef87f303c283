//! SVG inputs.
//!
//! An SVG converted to SVG is passed through untouched. Anything else is
//! rasterized in process with resvg at the document's intrinsic size, capped
//! at [`MAX_EDGE`] pixels on the longest edge. System fonts are loaded once
//! per process.

use super::{DecodeError, DecodeOutcome};
use crate::format::{Container, TargetFormat};
use image::{DynamicImage, RgbaImage};
use resvg::{tiny_skia, usvg};
use std::path::Path;
use std::sync::{Arc, LazyLock};

/// Longest edge of a rasterized SVG.
pub const MAX_EDGE: u32 = 8192;

static FONTS: LazyLock<Arc<usvg::fontdb::Database>> = LazyLock::new(|| {
    let mut db = usvg::fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
});

pub fn decode_svg(
    input: &Path,
    file: &str,
    target: &TargetFormat,
) -> Result<DecodeOutcome, DecodeError> {
    if target.container() == Container::Svg {
        return Ok(DecodeOutcome::borrowed_file(
            input.to_path_buf(),
            Container::Svg,
            "passthrough",
        ));
    }
    let data = std::fs::read(input)?;
    let img = rasterize(&data).map_err(|message| DecodeError::Svg {
        file: file.to_string(),
        message,
    })?;
    Ok(DecodeOutcome::in_memory(img, "resvg"))
}

/// Render SVG source to an RGBA bitmap.
pub fn rasterize(data: &[u8]) -> Result<DynamicImage, String> {
    rasterize_within(data, MAX_EDGE)
}

fn rasterize_within(data: &[u8], max_edge: u32) -> Result<DynamicImage, String> {
    let options = usvg::Options {
        fontdb: Arc::clone(&FONTS),
        ..usvg::Options::default()
    };
    let tree = usvg::Tree::from_data(data, &options).map_err(|e| e.to_string())?;

    let size = tree.size();
    let (width, height) = (size.width(), size.height());
    if width < 1.0 || height < 1.0 {
        return Err(format!("document has no area ({width}x{height})"));
    }
    let scale = (max_edge as f32 / width.max(height)).min(1.0);
    let out_w = ((width * scale).round() as u32).max(1);
    let out_h = ((height * scale).round() as u32).max(1);

    let mut pixmap = tiny_skia::Pixmap::new(out_w, out_h)
        .ok_or_else(|| format!("cannot allocate {out_w}x{out_h} canvas"))?;
    let transform = tiny_skia::Transform::from_scale(out_w as f32 / width, out_h as f32 / height);
    resvg::render(&tree, transform, &mut pixmap.as_mut());

    // tiny-skia stores premultiplied alpha.
    let mut rgba = Vec::with_capacity((out_w * out_h * 4) as usize);
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    RgbaImage::from_raw(out_w, out_h, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| "pixel buffer does not match canvas size".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodedImage;
    use crate::test_helpers::SIMPLE_SVG;
    use tempfile::TempDir;

    #[test]
    fn svg_target_passes_through_the_input() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("c.svg");
        std::fs::write(&input, SIMPLE_SVG).unwrap();

        let outcome = decode_svg(&input, "c.svg", &TargetFormat::Svg).unwrap();
        assert_eq!(outcome.engine, "passthrough");
        match outcome.image {
            DecodedImage::File { path, container } => {
                assert_eq!(path, input);
                assert_eq!(container, Container::Svg);
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn raster_target_renders_at_intrinsic_size() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("c.svg");
        std::fs::write(&input, SIMPLE_SVG).unwrap();

        let outcome = decode_svg(&input, "c.svg", &TargetFormat::Png).unwrap();
        let img = outcome.image.load().unwrap();
        assert_eq!((img.width(), img.height()), (120, 80));
        // Background rect colour at a corner.
        let px = img.to_rgba8().get_pixel(2, 2).0;
        assert_eq!(px, [0x33, 0x66, 0xcc, 0xff]);
    }

    #[test]
    fn huge_documents_are_capped() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="2000" height="1000"><rect width="2000" height="1000"/></svg>"#;
        let img = rasterize_within(svg.as_bytes(), 100).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
    }

    #[test]
    fn invalid_svg_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("bad.svg");
        std::fs::write(&input, "<svg").unwrap();
        let err = decode_svg(&input, "bad.svg", &TargetFormat::Png).unwrap_err();
        assert!(matches!(err, DecodeError::Svg { .. }));
        assert!(err.to_string().contains("bad.svg"));
    }
}
