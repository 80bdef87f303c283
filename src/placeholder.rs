//! Diagnostic placeholders for files that could not be converted.
//!
//! A placeholder is a real image in the requested container: a dark
//! 1200x800 card with a red "Conversion failed" banner, the original file
//! name and the (truncated) error message. It is built as SVG source,
//! rasterized with resvg and encoded like any other output.
//!
//! | Target | Placeholder bytes |
//! |---|---|
//! | SVG | the SVG source itself |
//! | PSD | PNG, for the processor's PSD write path |
//! | JPEG, unknown | JPEG at `encode.placeholder_jpeg_quality` |
//! | PNG, WebP, TIFF | that container |

use crate::config::EncodeConfig;
use crate::decode::svg;
use crate::encode::{self, EncodeError};
use crate::format::{Container, TargetFormat};
use image::{DynamicImage, Rgb, RgbImage};
use maud::{Markup, html};
use tracing::warn;

pub const WIDTH: u32 = 1200;
pub const HEIGHT: u32 = 800;

/// Longest message shown on the card, in characters.
pub const MAX_MESSAGE_CHARS: usize = 160;

const BACKGROUND: [u8; 3] = [0x11, 0x18, 0x27];
const FONT: &str = "Arial, Helvetica, sans-serif";

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut short: String = message.chars().take(MAX_MESSAGE_CHARS - 3).collect();
    short.push_str("...");
    short
}

/// The placeholder card as SVG source. Maud escapes the name and message.
pub fn placeholder_svg(original_name: &str, message: &str) -> String {
    card(original_name, &truncate(message)).into_string()
}

fn card(original_name: &str, message: &str) -> Markup {
    let view_box = format!("0 0 {WIDTH} {HEIGHT}");
    html! {
        svg xmlns="http://www.w3.org/2000/svg" width=(WIDTH) height=(HEIGHT) viewBox=(view_box) {
            rect width=(WIDTH) height=(HEIGHT) fill="#111827" {}
            rect x="0" y="0" width=(WIDTH) height="12" fill="#ef4444" {}
            text x="600" y="330" font-family=(FONT) font-size="42" font-weight="bold"
                fill="#ef4444" text-anchor="middle" { "Conversion failed" }
            text x="600" y="400" font-family=(FONT) font-size="24"
                fill="#e5e7eb" text-anchor="middle" { (original_name) }
            text x="600" y="460" font-family=(FONT) font-size="20"
                fill="#9ca3af" text-anchor="middle" { (message) }
        }
    }
}

/// The container a placeholder for `target` is encoded in.
pub fn placeholder_container(target: &TargetFormat) -> Container {
    match target.container() {
        Container::Psd => Container::Png,
        other => other,
    }
}

/// Build a placeholder for `target`. Never fails and never returns an
/// empty buffer.
pub fn make_placeholder(
    target: &TargetFormat,
    original_name: &str,
    message: &str,
    settings: &EncodeConfig,
) -> Vec<u8> {
    let source = placeholder_svg(original_name, message);
    let container = placeholder_container(target);
    if container == Container::Svg {
        return source.into_bytes();
    }

    let card = svg::rasterize(source.as_bytes()).unwrap_or_else(|e| {
        warn!(file = original_name, "placeholder render failed, using a plain card: {e}");
        plain_card()
    });
    match encode_card(&card, container, settings) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => source.into_bytes(),
        Err(e) => {
            warn!(file = original_name, ?container, "placeholder encode failed: {e}");
            source.into_bytes()
        }
    }
}

fn encode_card(
    card: &DynamicImage,
    container: Container,
    settings: &EncodeConfig,
) -> Result<Vec<u8>, EncodeError> {
    match container {
        Container::Jpeg => encode::encode_jpeg(card, settings.placeholder_jpeg_quality),
        other => encode::encode_buffer(card, other, settings),
    }
}

fn plain_card() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(WIDTH, HEIGHT, Rgb(BACKGROUND)))
}
