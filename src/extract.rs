//! One-shot extraction: submit a PDF, wait, return the global table.
//!
//! These functions assemble a fresh [`AppContext`] per call. Services that
//! handle many documents should build one context and use
//! [`AppContext::submit`] directly, so the concurrency cap is shared.

use crate::app::AppContext;
use crate::config::ExtractionConfig;
use crate::error::Pdf2TableError;
use crate::output::GlobalTable;
use crate::pipeline::input::read_pdf;
use crate::progress::{DocumentState, ProgressState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Result of a completed extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub document_id: String,
    /// Final progress record (`completed`).
    pub status: ProgressState,
    pub table: GlobalTable,
}

/// Extract every table row from a local PDF file.
///
/// # Example
/// ```rust,no_run
/// use edgequake_pdf2table::{extract_tables, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
/// let config = ExtractionConfig::builder().storage_dir("out").build()?;
/// let output = extract_tables("statement.pdf", None, &config).await?;
/// println!("{} rows under {:?}", output.table.rows.len(), output.table.header);
/// # Ok(())
/// # }
/// ```
pub async fn extract_tables(
    path: impl AsRef<Path>,
    password: Option<&str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TableError> {
    let bytes = read_pdf(path).await?;
    extract_tables_from_bytes(bytes, password, config).await
}

/// Extract every table row from PDF bytes held in memory.
pub async fn extract_tables_from_bytes(
    bytes: impl Into<Arc<[u8]>>,
    password: Option<&str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TableError> {
    let app = AppContext::from_config(config.clone());
    let result = extract_with(&app, bytes, password).await;
    app.shutdown().await;
    result
}

/// Synchronous wrapper around [`extract_tables`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_tables_sync(
    path: impl AsRef<Path>,
    password: Option<&str>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, Pdf2TableError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2TableError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract_tables(path, password, config))
}

/// Submit to an existing context and wait for the outcome.
pub async fn extract_with(
    app: &AppContext,
    bytes: impl Into<Arc<[u8]>>,
    password: Option<&str>,
) -> Result<ExtractionOutput, Pdf2TableError> {
    let submission = app.submit(bytes, password.map(str::to_string)).await?;
    let document_id = submission.document_id;
    let status = app.wait(&document_id).await?;

    if status.state != DocumentState::Completed {
        return Err(Pdf2TableError::ProcessingFailed {
            document_id,
            message: status.message.unwrap_or_else(|| "unknown error".to_string()),
        });
    }

    let table = app.global_table(&document_id).await?.ok_or_else(|| {
        Pdf2TableError::Internal(format!(
            "Document {document_id} completed without a global table"
        ))
    })?;
    info!(
        "Document {}: {} rows extracted from {} pages",
        document_id,
        table.rows.len(),
        submission.num_pages
    );

    Ok(ExtractionOutput {
        document_id,
        status,
        table,
    })
}
