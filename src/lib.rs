//! # edgequake-pdf2table
//!
//! Extract tabular data from PDF documents using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Text-layer extractors lose table structure: cells come out in reading
//! order with no column boundaries, and scanned statements have no text layer
//! at all. This crate rasterises each page, cuts it into overlapping
//! horizontal bands, and asks a VLM to transcribe each band as delimited
//! rows. The bands are stitched back into one table per page (header
//! reconciliation, overlap dedup) and one table per document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input   check magic bytes, page count, password
//!  ├─ 2. Render  rasterise pages via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Chunk   overlapping bands, geometry scaled by DPI
//!  ├─ 4. VLM     concurrent calls under a shared semaphore, quota-aware retry
//!  ├─ 5. Merge   parse rows, reconcile headers, dedup overlap, in chunk order
//!  └─ 6. Output  tables/page_N.json + tables/global.json, progress record
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2table::{AppContext, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = AppContext::from_config(ExtractionConfig::default());
//!     let bytes = std::fs::read("statement.pdf")?;
//!     let submission = app.submit(bytes, None).await?;
//!
//!     // Poll `app.status(..)` from elsewhere, or just wait.
//!     let status = app.wait(&submission.document_id).await?;
//!     if let Some(table) = app.global_table(&submission.document_id).await? {
//!         println!("{}: {} rows", status.state, table.rows.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2table` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-pdf2table = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod app;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use app::{AppContext, Submission, TaskOutcome, TaskRegistry};
pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ModelError, Pdf2TableError, ProgressError, SchemaError, StorageError};
pub use extract::{extract_tables, extract_tables_from_bytes, extract_tables_sync, extract_with, ExtractionOutput};
pub use output::{BoundingBox, GlobalTable, GlobalTableRow, PageTable, RowMetadata, Table};
pub use pipeline::llm::{ModelClient, ModelInvoker, RetryPolicy};
pub use pipeline::render::{PdfiumRenderer, Renderer};
pub use processor::DocumentProcessor;
pub use progress::{DocumentState, ProgressHandle, ProgressState, ProgressStore, ProgressUpdate};
pub use storage::{FilesystemStorage, Storage};
