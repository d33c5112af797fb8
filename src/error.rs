//! Error types for the edgequake-pdf2table library.
//!
//! The taxonomy mirrors how failures are contained:
//!
//! * [`Pdf2TableError`] — **Fatal** for one call or one document: bad input,
//!   missing provider, storage failure, or a chunk that exhausted its retries.
//!   Input errors are raised before any document state exists; everything
//!   else raised inside the orchestrator is folded into a terminal `failed`
//!   progress record instead of escaping.
//!
//! * [`ModelError`] — a single model call failed. Retried locally by
//!   [`crate::pipeline::llm::ModelInvoker`]; only surfaces once the attempt
//!   budget is spent.
//!
//! * [`StorageError`] / [`SchemaError`] — persistence and JSON-shape
//!   violations of the page/global table contract.
//!
//! * [`ProgressError`] — rejected progress-state mutations (unknown
//!   document, terminal state, illegal transition, regressing progress).

use crate::progress::DocumentState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2table library.
#[derive(Debug, Error)]
pub enum Pdf2TableError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The bytes are not a PDF.
    #[error("Input is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF is encrypted and requires a password.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Incorrect password for encrypted PDF.")]
    WrongPassword,

    // ── Rendering errors ──────────────────────────────────────────────────
    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Configuration errors ──────────────────────────────────────────────
    /// The configured provider could not be initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// A chunk extraction failed after every retry.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Persisting or loading an artifact failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The progress store rejected an update.
    #[error(transparent)]
    Progress(#[from] ProgressError),

    /// The document reached the `failed` state.
    #[error("Processing of document {document_id} failed: {message}")]
    ProcessingFailed {
        document_id: String,
        message: String,
    },

    /// Processing was cancelled before it finished.
    #[error("Processing of document {document_id} was cancelled")]
    Cancelled { document_id: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2TableError {
    /// Whether this error rejects the input itself (unreadable, not a PDF,
    /// encrypted). Such errors are reported to the caller before any
    /// document state is created.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Pdf2TableError::FileNotFound { .. }
                | Pdf2TableError::PermissionDenied { .. }
                | Pdf2TableError::NotAPdf { .. }
                | Pdf2TableError::CorruptPdf { .. }
                | Pdf2TableError::PasswordRequired
                | Pdf2TableError::WrongPassword
        )
    }

    /// Whether this error is a provider quota / rate-limit exhaustion.
    pub fn is_quota_error(&self) -> bool {
        match self {
            Pdf2TableError::Model(e) => e.is_quota(),
            other => looks_like_quota(&other.to_string()),
        }
    }
}

static RE_RETRY_IN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry in\s+([0-9]+(?:\.[0-9]+)?)s").unwrap());

/// Extract a `retry in <N>s` hint from a provider error message.
///
/// Providers such as Gemini embed the server-mandated delay in the message
/// text (`"Please retry in 31.184393644s."`) rather than in a header.
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = RE_RETRY_IN.captures(message)?;
    let secs: f64 = caps[1].parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn looks_like_quota(message: &str) -> bool {
    message.contains("ResourceExhausted")
        || message.contains("Quota exceeded")
        || message.contains("exceeded your current quota")
}

/// A failed model extraction call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The provider throttled the request (HTTP 429, quota exhausted).
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Any other provider failure.
    #[error("Model API error: {message}")]
    Api { message: String },

    /// The chunk image could not be encoded for transmission.
    #[error("Failed to encode chunk image: {0}")]
    Encode(String),
}

impl ModelError {
    /// Classify a raw provider error message.
    pub fn from_provider_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || looks_like_quota(&message)
        {
            let retry_after = parse_retry_after(&message);
            ModelError::RateLimited {
                message,
                retry_after,
            }
        } else {
            ModelError::Api { message }
        }
    }

    /// The delay the provider asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited {
                retry_after: Some(d),
                ..
            } => Some(*d),
            ModelError::RateLimited { message, .. } | ModelError::Api { message } => {
                parse_retry_after(message)
            }
            ModelError::Encode(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ModelError::RateLimited { .. })
    }

    fn is_quota(&self) -> bool {
        match self {
            ModelError::RateLimited { .. } => true,
            ModelError::Api { message } => looks_like_quota(message),
            ModelError::Encode(_) => false,
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on '{path}': {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Image encoding failed: {0}")]
    Image(String),

    #[error("Invalid document id '{0}'")]
    InvalidDocumentId(String),

    #[error("Schema violation: {0}")]
    Schema(#[from] SchemaError),
}

/// Violations of the page/global table JSON contract.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("page_number must be >= 1, got {0}")]
    InvalidPageNumber(usize),

    #[error("rows ({rows}) and row_metadata ({metadata}) lengths differ")]
    MetadataLengthMismatch { rows: usize, metadata: usize },

    #[error("row {row} has {width} cells but the header has {header}")]
    RowWidthMismatch {
        row: usize,
        width: usize,
        header: usize,
    },

    #[error("row {row} confidence {confidence} is outside [0, 1]")]
    ConfidenceOutOfRange { row: usize, confidence: f64 },

    #[error("row {row} bounding box is inverted: {detail}")]
    InvertedBoundingBox { row: usize, detail: String },

    #[error("row {row} metadata names page {found}, expected {expected}")]
    PageMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {row} has chunk_index 0 (chunks are 1-based)")]
    InvalidChunkIndex { row: usize },

    #[error("document_id must not be empty")]
    EmptyDocumentId,
}

/// Rejected progress-store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("Document {document_id} is already {state} and cannot change")]
    TerminalState {
        document_id: String,
        state: DocumentState,
    },

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: DocumentState,
        to: DocumentState,
    },

    #[error("Progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),

    #[error("Progress may not decrease ({from} -> {to})")]
    ProgressRegression { from: u8, to: u8 },

    #[error("Progress store is no longer running")]
    StoreClosed,
}
