//! Pipeline stages for PDF table extraction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets the
//! orchestrator swap implementations (a fake renderer, a scripted model)
//! without touching the other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ chunk ──▶ encode ──▶ llm ──▶ parse
//! (bytes)   (pdfium)   (bands)   (PNG)      (VLM)   (rows, merge)
//! ```
//!
//! 1. [`input`]  — read a local file and check the PDF magic
//! 2. [`render`] — rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`chunk`]  — cut each page into overlapping horizontal bands
//! 4. [`encode`] — optional downscale, PNG for storage, base64 for the model
//! 5. [`llm`]    — drive the model call under the shared concurrency limit
//!    with quota-aware retry; the only stage with network I/O
//! 6. [`parse`]  — turn delimited text into rows and merge a page's chunks
//!    into one table

pub mod chunk;
pub mod encode;
pub mod input;
pub mod llm;
pub mod parse;
pub mod render;
