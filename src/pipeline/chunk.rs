//! Chunker: slice a page image into overlapping horizontal bands.
//!
//! A whole page sent as one image makes the model skip or merge rows on
//! long tables. Bands of fixed physical height keep each request small
//! enough to be read reliably; the overlap makes sure a row cut by a band
//! boundary appears whole in at least one band.
//!
//! Geometry is computed by [`chunk_spans`] (pure, no pixels involved) and
//! applied to an image by [`split`].

use image::DynamicImage;

/// Vertical extent of one chunk within its page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// 1-based position of the chunk within the page.
    pub chunk_index: usize,
    pub top: u32,
    pub bottom: u32,
}

impl ChunkSpan {
    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// A band of a page image submitted as one extraction unit.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_index: usize,
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
    pub image: DynamicImage,
}

impl Chunk {
    pub fn span(&self) -> ChunkSpan {
        ChunkSpan {
            chunk_index: self.chunk_index,
            top: self.top,
            bottom: self.bottom,
        }
    }
}

/// Compute the chunk spans for a page of `height` pixels.
///
/// Starting at `y = 0`, each chunk covers
/// `[max(0, y - overlap), min(height, y + chunk_height + overlap)]`, except
/// that the first chunk never reaches above 0. `y` then advances by
/// `chunk_height` until it reaches `height`.
pub fn chunk_spans(height: u32, chunk_height: u32, overlap: u32) -> Vec<ChunkSpan> {
    let step = chunk_height.max(1);
    let mut spans = Vec::with_capacity((height / step) as usize + 1);
    let mut y: u32 = 0;
    while y < height {
        let lead = if spans.is_empty() { 0 } else { overlap };
        let top = y.saturating_sub(lead);
        let bottom = y.saturating_add(step).saturating_add(overlap).min(height);
        spans.push(ChunkSpan {
            chunk_index: spans.len() + 1,
            top,
            bottom,
        });
        y = y.saturating_add(step);
    }
    spans
}

/// Split `page` into full-width chunks. `chunk_height` and `overlap` are in
/// pixels; callers scale logical units by DPI first (see
/// [`crate::config::ExtractionConfig::scaled_chunk_geometry`]).
pub fn split(page: &DynamicImage, chunk_height: u32, overlap: u32) -> Vec<Chunk> {
    let width = page.width();
    chunk_spans(page.height(), chunk_height, overlap)
        .into_iter()
        .map(|span| Chunk {
            chunk_index: span.chunk_index,
            top: span.top,
            bottom: span.bottom,
            left: 0,
            right: width,
            image: page.crop_imm(0, span.top, width, span.height()),
        })
        .collect()
}
