//! PDF rasterisation: render every page of an in-memory PDF via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking pool so the
//! Tokio workers driving model calls never stall during rendering.
//!
//! The orchestrator only sees the [`Renderer`] trait, so tests substitute a
//! synthetic renderer and never need a pdfium library.

use crate::error::Pdf2TableError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Turns PDF bytes into page images.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Number of pages, validating that the document opens with `password`.
    async fn page_count(&self, pdf: Arc<[u8]>, password: Option<String>) -> Result<usize, Pdf2TableError>;

    /// Rasterise every page at `dpi`, in page order.
    async fn render(
        &self,
        pdf: Arc<[u8]>,
        password: Option<String>,
        dpi: u32,
    ) -> Result<Vec<DynamicImage>, Pdf2TableError>;
}

/// [`Renderer`] backed by pdfium-render.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    library_path: Option<PathBuf>,
    max_pixels: u32,
}

impl PdfiumRenderer {
    /// `library_path`: explicit pdfium shared library, or None for the
    /// system library. `max_pixels` caps either rendered dimension.
    pub fn new(library_path: Option<PathBuf>, max_pixels: u32) -> Self {
        Self {
            library_path,
            max_pixels,
        }
    }
}

#[async_trait]
impl Renderer for PdfiumRenderer {
    async fn page_count(&self, pdf: Arc<[u8]>, password: Option<String>) -> Result<usize, Pdf2TableError> {
        let lib = self.library_path.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind(lib.as_ref())?;
            let document = open(&pdfium, &pdf, password.as_deref())?;
            Ok(document.pages().len() as usize)
        })
        .await
        .map_err(|e| Pdf2TableError::Internal(format!("Page-count task panicked: {}", e)))?
    }

    async fn render(
        &self,
        pdf: Arc<[u8]>,
        password: Option<String>,
        dpi: u32,
    ) -> Result<Vec<DynamicImage>, Pdf2TableError> {
        let lib = self.library_path.clone();
        let max_pixels = self.max_pixels;
        tokio::task::spawn_blocking(move || {
            render_blocking(lib.as_ref(), &pdf, password.as_deref(), dpi, max_pixels)
        })
        .await
        .map_err(|e| Pdf2TableError::Internal(format!("Render task panicked: {}", e)))?
    }
}

fn bind(library_path: Option<&PathBuf>) -> Result<Pdfium, Pdf2TableError> {
    let bindings = match library_path {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| Pdf2TableError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn open<'a>(
    pdfium: &'a Pdfium,
    bytes: &'a [u8],
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, Pdf2TableError> {
    pdfium.load_pdf_from_byte_slice(bytes, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                Pdf2TableError::WrongPassword
            } else {
                Pdf2TableError::PasswordRequired
            }
        } else {
            Pdf2TableError::CorruptPdf { detail: err_str }
        }
    })
}

/// Blocking implementation of page rendering.
fn render_blocking(
    library_path: Option<&PathBuf>,
    bytes: &[u8],
    password: Option<&str>,
    dpi: u32,
    max_pixels: u32,
) -> Result<Vec<DynamicImage>, Pdf2TableError> {
    let pdfium = bind(library_path)?;
    let document = open(&pdfium, bytes, password)?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages, rendering at {} DPI", total_pages, dpi);

    // Page sizes are in points (1/72 inch).
    let scale = (dpi as f32 / 72.0).max(1.0);
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(total_pages);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            Pdf2TableError::RasterisationFailed {
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        // Flatten alpha: the model and the chunker only need RGB.
        let image = DynamicImage::ImageRgb8(bitmap.as_image().into_rgb8());
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        results.push(image);
    }

    Ok(results)
}
