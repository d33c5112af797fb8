//! Image encoding for the two consumers of rendered pixels.
//!
//! * The model receives each chunk as a base64 PNG wrapped in `ImageData`,
//!   optionally downscaled first to cut upload size and latency.
//! * Storage receives pages and chunks as PNG bytes written with fast
//!   compression: these files are written once per run and rarely read, so
//!   CPU time matters more than disk size.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::imageops::FilterType as ResizeFilter;
use image::DynamicImage;
use std::borrow::Cow;
use std::io::Cursor;
use tracing::debug;

/// Cap `img` at `max_width` pixels wide, preserving aspect ratio.
///
/// Returns the input untouched when no cap is set or it is already narrow
/// enough.
pub fn downscale(img: &DynamicImage, max_width: Option<u32>) -> Cow<'_, DynamicImage> {
    match max_width {
        Some(max_w) if max_w > 0 && img.width() > max_w => {
            let ratio = max_w as f64 / img.width() as f64;
            let new_h = ((img.height() as f64 * ratio).round() as u32).max(1);
            debug!(
                "Downscaling {}x{} → {}x{}",
                img.width(),
                img.height(),
                max_w,
                new_h
            );
            Cow::Owned(img.resize_exact(max_w, new_h, ResizeFilter::Lanczos3))
        }
        _ => Cow::Borrowed(img),
    }
}

/// PNG bytes with fast compression, for persisted artifacts.
pub fn encode_png_fast(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(Cursor::new(&mut buf), CompressionType::Fast, FilterType::Adaptive);
    img.write_with_encoder(encoder)?;
    Ok(buf)
}

/// Encode a chunk as a base64 PNG ready for the VLM API.
///
/// PNG rather than JPEG: compression artefacts around thin table rules and
/// small digits are exactly what makes models misread cells.
pub fn encode_chunk(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded chunk → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_small_chunk() {
        let data = encode_chunk(&solid(10, 10)).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn fast_png_round_trips() {
        let bytes = encode_png_fast(&solid(7, 3)).unwrap();
        let back = image::load_from_memory(&bytes).unwrap();
        assert_eq!((back.width(), back.height()), (7, 3));
    }

    #[test]
    fn downscale_caps_width() {
        let img = solid(2000, 500);
        let out = downscale(&img, Some(1000));
        assert_eq!((out.width(), out.height()), (1000, 250));
    }

    #[test]
    fn downscale_passthrough() {
        let img = solid(800, 500);
        assert!(matches!(downscale(&img, Some(1000)), Cow::Borrowed(_)));
        assert!(matches!(downscale(&img, None), Cow::Borrowed(_)));
    }
}
