//! Configuration types for PDF table extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. One struct holds every knob so the
//! same configuration can be shared by the orchestrator, the model invoker and
//! the storage layer without threading a dozen parameters through each call.

use crate::error::Pdf2TableError;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a table-extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdf2table::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .dpi(200)
///     .concurrency(4)
///     .chunk_height(400)
///     .overlap(40)
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI used when rasterising each PDF page. Range: 72–600. Default: 300.
    ///
    /// Table cells are often set in small type; 300 DPI keeps digits legible
    /// to the model. Chunk geometry scales with this value (see
    /// [`Self::scaled_chunk_geometry`]) so the physical band height is
    /// independent of render resolution.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 6000.
    pub max_rendered_pixels: u32,

    /// Chunk band height in logical units (1/72 inch). Default: 500.
    pub chunk_height: u32,

    /// Vertical overlap between consecutive chunks in logical units. Default: 50.
    ///
    /// Rows that straddle a chunk boundary are seen by both chunks and
    /// removed again by the merger's overlap deduplication.
    pub overlap: u32,

    /// Maximum model calls in flight at once, across the whole processor. Default: 3.
    ///
    /// Table extraction sends many small requests per page; keeping this low
    /// is what keeps a free-tier quota from being exhausted.
    pub concurrency: usize,

    /// Attempts per chunk before the failure becomes fatal. Default: 6.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds. Default: 2000.
    pub retry_base_ms: u64,

    /// Backoff ceiling in milliseconds. Default: 60 000.
    pub retry_max_ms: u64,

    /// Cap on chunk image width before transmission. Default: None (no cap).
    pub max_chunk_width: Option<u32>,

    /// Cell delimiter the model is asked to emit. Default: `'|'`.
    pub delimiter: char,

    /// Custom extraction prompt. If None, uses the built-in default.
    pub prompt: Option<String>,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0 (transcription, not creativity).
    pub temperature: f32,

    /// Maximum tokens the model may generate per chunk. Default: 8192.
    pub max_tokens: usize,

    /// Persist the uploaded PDF as `original.pdf`. Default: true.
    pub save_original_pdf: bool,

    /// Persist each rendered page as PNG. Default: true.
    pub save_page_images: bool,

    /// Persist every chunk image (debugging; expensive). Default: false.
    pub save_chunk_images: bool,

    /// Persist every raw model response (debugging). Default: false.
    pub save_raw_chunks: bool,

    /// Root directory for per-document artifacts. Default: `./storage`.
    pub storage_dir: PathBuf,

    /// Explicit pdfium library to bind. If None, the system library is used.
    pub pdfium_library_path: Option<PathBuf>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 6000,
            chunk_height: 500,
            overlap: 50,
            concurrency: 3,
            max_attempts: 6,
            retry_base_ms: 2000,
            retry_max_ms: 60_000,
            max_chunk_width: None,
            delimiter: '|',
            prompt: None,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 8192,
            save_original_pdf: true,
            save_page_images: true,
            save_chunk_images: false,
            save_raw_chunks: false,
            storage_dir: PathBuf::from("storage"),
            pdfium_library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("chunk_height", &self.chunk_height)
            .field("overlap", &self.overlap)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_max_ms", &self.retry_max_ms)
            .field("max_chunk_width", &self.max_chunk_width)
            .field("delimiter", &self.delimiter)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("save_page_images", &self.save_page_images)
            .field("save_chunk_images", &self.save_chunk_images)
            .field("save_raw_chunks", &self.save_raw_chunks)
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Chunk height and overlap converted to page-image pixels.
    ///
    /// Logical units are scaled by `max(1, dpi / 72)` so a chunk always
    /// covers the same physical strip of paper.
    pub fn scaled_chunk_geometry(&self) -> (u32, u32) {
        let scale = (self.dpi as f64 / 72.0).max(1.0);
        let height = (self.chunk_height as f64 * scale).round() as u32;
        let overlap = (self.overlap as f64 * scale).round() as u32;
        (height.max(1), overlap)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn chunk_height(mut self, h: u32) -> Self {
        self.config.chunk_height = h;
        self
    }

    pub fn overlap(mut self, o: u32) -> Self {
        self.config.overlap = o;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_base_ms(mut self, ms: u64) -> Self {
        self.config.retry_base_ms = ms;
        self
    }

    pub fn retry_max_ms(mut self, ms: u64) -> Self {
        self.config.retry_max_ms = ms;
        self
    }

    pub fn max_chunk_width(mut self, px: u32) -> Self {
        self.config.max_chunk_width = (px > 0).then_some(px);
        self
    }

    pub fn delimiter(mut self, d: char) -> Self {
        self.config.delimiter = d;
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn save_original_pdf(mut self, v: bool) -> Self {
        self.config.save_original_pdf = v;
        self
    }

    pub fn save_page_images(mut self, v: bool) -> Self {
        self.config.save_page_images = v;
        self
    }

    pub fn save_chunk_images(mut self, v: bool) -> Self {
        self.config.save_chunk_images = v;
        self
    }

    pub fn save_raw_chunks(mut self, v: bool) -> Self {
        self.config.save_raw_chunks = v;
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = dir.into();
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, Pdf2TableError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2TableError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.chunk_height == 0 {
            return Err(Pdf2TableError::InvalidConfig(
                "Chunk height must be ≥ 1".into(),
            ));
        }
        if c.concurrency == 0 {
            return Err(Pdf2TableError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_attempts == 0 {
            return Err(Pdf2TableError::InvalidConfig(
                "Max attempts must be ≥ 1".into(),
            ));
        }
        if c.delimiter.is_whitespace() {
            return Err(Pdf2TableError::InvalidConfig(
                "Delimiter must not be whitespace".into(),
            ));
        }
        Ok(self.config)
    }
}
