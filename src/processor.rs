//! Pipeline orchestrator: drives one document from PDF bytes to tables.
//!
//! ## Per-page algorithm
//!
//! Pages run strictly in order. For each page:
//!
//! 1. advance `current_page` and persist the page image (best-effort);
//! 2. spawn one task per chunk into a [`JoinSet`]; each task waits on the
//!    invoker's shared semaphore, so at most `concurrency` model calls are
//!    in flight no matter how many chunks are queued;
//! 3. collect results **as they complete**, bumping `current_chunk` and
//!    `progress` per arrival;
//! 4. merge the texts **in chunk order** through [`PageMerger`], so header
//!    reconciliation and overlap dedup never depend on network timing;
//! 5. write the page table and append its rows to the global table.
//!
//! ## Failure containment
//!
//! [`DocumentProcessor::process`] never returns an error. A chunk that
//! exhausts its retries aborts its siblings (`JoinSet::shutdown`), a
//! diagnostic is written to `raw/error.txt`, and the document ends `failed`
//! with a user-safe message. Without a usable model the document fails
//! immediately: nothing is rendered and nothing is written.

use crate::config::ExtractionConfig;
use crate::error::Pdf2TableError;
use crate::output::{GlobalTable, GlobalTableBuilder, PageTable};
use crate::pipeline::chunk::{self, Chunk, ChunkSpan};
use crate::pipeline::encode::{downscale, encode_png_fast};
use crate::pipeline::llm::{ChunkLabel, ModelInvoker};
use crate::pipeline::parse::PageMerger;
use crate::pipeline::render::Renderer;
use crate::progress::{percent, DocumentProgress, DocumentState, ProgressHandle, ProgressUpdate};
use crate::storage::Storage;
use image::DynamicImage;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::error::Error as _;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Message stored on a document that hit a provider quota.
pub const QUOTA_MESSAGE: &str =
    "Model provider rate limit/quota exceeded. Please wait a bit and try again (or upgrade billing/limits).";

/// User-safe description of a failure.
///
/// Quota exhaustion gets a fixed explanation; everything else passes its own
/// message through.
pub fn friendly_message(err: &Pdf2TableError) -> String {
    if err.is_quota_error() {
        QUOTA_MESSAGE.to_string()
    } else {
        err.to_string()
    }
}

/// Runs the extraction pipeline for documents.
///
/// One processor serves every document of an [`crate::AppContext`]; its
/// model invoker, and therefore the concurrency cap, is shared by all of
/// them.
pub struct DocumentProcessor {
    renderer: Arc<dyn Renderer>,
    model: Result<ModelInvoker, String>,
    storage: Arc<dyn Storage>,
    progress: ProgressHandle,
    config: ExtractionConfig,
}

impl DocumentProcessor {
    /// `model` is `Err(reason)` when no provider could be configured;
    /// documents then fail with `reason` without being rendered.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        model: Result<ModelInvoker, String>,
        storage: Arc<dyn Storage>,
        progress: ProgressHandle,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            renderer,
            model,
            storage,
            progress,
            config,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    /// Process one document to a terminal state and return that state.
    ///
    /// The progress record for `document_id` must already exist.
    pub async fn process(
        &self,
        document_id: &str,
        pdf: Arc<[u8]>,
        password: Option<String>,
    ) -> DocumentState {
        let progress = DocumentProgress::new(self.progress.clone(), document_id);

        let invoker = match &self.model {
            Ok(invoker) => invoker,
            Err(reason) => {
                error!("Document {}: no model available — {}", document_id, reason);
                progress
                    .update(
                        ProgressUpdate::new()
                            .state(DocumentState::Failed)
                            .progress(0)
                            .message(reason.clone()),
                    )
                    .await;
                return DocumentState::Failed;
            }
        };

        let start = Instant::now();
        match self.run(&progress, invoker, pdf, password).await {
            Ok(global) => {
                info!(
                    "Document {}: completed, {} rows in {:?}",
                    document_id,
                    global.rows.len(),
                    start.elapsed()
                );
                progress
                    .update(
                        ProgressUpdate::new()
                            .state(DocumentState::Completed)
                            .progress(100)
                            .current_page(None)
                            .current_chunk(None)
                            .clear_message(),
                    )
                    .await;
                DocumentState::Completed
            }
            Err(e) => {
                self.fail(&progress, &e).await;
                DocumentState::Failed
            }
        }
    }

    async fn fail(&self, progress: &DocumentProgress, err: &Pdf2TableError) {
        let document_id = progress.document_id();
        let message = friendly_message(err);
        error!("Document {}: processing failed — {}", document_id, err);

        if let Err(e) = self
            .storage
            .write_diagnostic(document_id, &diagnostic_report(&message, err))
            .await
        {
            warn!("Document {}: could not write diagnostic — {}", document_id, e);
        }

        progress
            .update(
                ProgressUpdate::new()
                    .state(DocumentState::Failed)
                    .message(message)
                    .current_page(None)
                    .current_chunk(None),
            )
            .await;
    }

    async fn run(
        &self,
        progress: &DocumentProgress,
        invoker: &ModelInvoker,
        pdf: Arc<[u8]>,
        password: Option<String>,
    ) -> Result<GlobalTable, Pdf2TableError> {
        let document_id = progress.document_id();
        let config = &self.config;

        progress
            .update(ProgressUpdate::new().state(DocumentState::Processing).clear_message())
            .await;

        if config.save_original_pdf {
            self.storage.write_original(document_id, &pdf).await?;
        }

        let pages: Vec<Arc<DynamicImage>> = self
            .renderer
            .render(pdf, password, config.dpi)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

        let (chunk_height, overlap) = config.scaled_chunk_geometry();
        let spans: Vec<Vec<ChunkSpan>> = pages
            .iter()
            .map(|p| chunk::chunk_spans(p.height(), chunk_height, overlap))
            .collect();
        let total_chunks: usize = spans.iter().map(Vec::len).sum();
        info!(
            "Document {}: {} pages, {} chunks ({}px bands, {}px overlap)",
            document_id,
            pages.len(),
            total_chunks,
            chunk_height,
            overlap
        );
        progress
            .update(ProgressUpdate::new().totals(pages.len(), total_chunks))
            .await;

        let ctx = Arc::new(ChunkContext {
            document_id: Arc::from(document_id),
            storage: Arc::clone(&self.storage),
            invoker: invoker.clone(),
            progress: progress.clone(),
            max_chunk_width: config.max_chunk_width,
            save_chunk_images: config.save_chunk_images,
            save_raw_chunks: config.save_raw_chunks,
        });

        let mut global = GlobalTableBuilder::new();
        let mut done = 0usize;

        for (idx, page) in pages.iter().enumerate() {
            let page_number = idx + 1;
            progress
                .update(
                    ProgressUpdate::new()
                        .current_page(Some(page_number))
                        .current_chunk(None),
                )
                .await;

            if config.save_page_images {
                self.save_page_image(document_id, page_number, Arc::clone(page)).await;
            }

            let chunks = chunk::split(page, chunk_height, overlap);
            let texts = collect_chunk_texts(&ctx, page_number, chunks, &mut done, total_chunks).await?;

            let mut merger = PageMerger::new(page_number, page.width(), config.delimiter);
            for span in &spans[idx] {
                let text = texts.get(&span.chunk_index).map(String::as_str).unwrap_or("");
                merger.push_chunk(*span, text);
            }
            let table = merger.finish();
            debug!(
                "Document {}: page {} merged into {} rows",
                document_id,
                page_number,
                table.len()
            );

            global.push_page(page_number, &table);
            self.storage
                .write_page_table(&PageTable::new(document_id, page_number, table))
                .await?;

            progress.update(ProgressUpdate::new().current_chunk(None)).await;
        }

        let global = global.finish(document_id);
        self.storage.write_global_table(&global).await?;
        Ok(global)
    }

    async fn save_page_image(&self, document_id: &str, page_number: usize, page: Arc<DynamicImage>) {
        let encoded = tokio::task::spawn_blocking(move || encode_png_fast(&page)).await;
        let result = match encoded {
            Ok(Ok(png)) => self
                .storage
                .write_page_image(document_id, page_number, &png)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!(
                "Document {}: could not save image of page {} — {}",
                document_id, page_number, e
            );
        }
    }
}

/// What a chunk task needs; shared by every task of a document.
struct ChunkContext {
    document_id: Arc<str>,
    storage: Arc<dyn Storage>,
    invoker: ModelInvoker,
    progress: DocumentProgress,
    max_chunk_width: Option<u32>,
    save_chunk_images: bool,
    save_raw_chunks: bool,
}

/// Run every chunk of one page concurrently and gather the texts by chunk
/// index, updating progress in arrival order.
///
/// On the first failure the remaining tasks are aborted and awaited before
/// the error is returned.
async fn collect_chunk_texts(
    ctx: &Arc<ChunkContext>,
    page_number: usize,
    chunks: Vec<Chunk>,
    done: &mut usize,
    total_chunks: usize,
) -> Result<HashMap<usize, String>, Pdf2TableError> {
    let mut tasks = JoinSet::new();
    for chunk in chunks {
        tasks.spawn(extract_one_chunk(Arc::clone(ctx), page_number, chunk));
    }

    let mut texts = HashMap::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| Pdf2TableError::Internal(format!("Chunk task failed to complete: {e}")))
            .and_then(|r| r);
        match outcome {
            Ok((chunk_index, text)) => {
                texts.insert(chunk_index, text);
                *done += 1;
                ctx.progress
                    .update(
                        ProgressUpdate::new()
                            .current_chunk(Some(chunk_index))
                            .progress(percent(*done, total_chunks)),
                    )
                    .await;
            }
            Err(e) => {
                tasks.shutdown().await;
                return Err(e);
            }
        }
    }
    Ok(texts)
}

async fn extract_one_chunk(
    ctx: Arc<ChunkContext>,
    page_number: usize,
    chunk: Chunk,
) -> Result<(usize, String), Pdf2TableError> {
    let chunk_index = chunk.chunk_index;

    if ctx.save_chunk_images {
        match encode_png_fast(&chunk.image) {
            Ok(png) => {
                if let Err(e) = ctx
                    .storage
                    .write_chunk_image(&ctx.document_id, page_number, chunk_index, &png)
                    .await
                {
                    warn!("Could not save image of page {} chunk {} — {}", page_number, chunk_index, e);
                }
            }
            Err(e) => warn!("Could not encode page {} chunk {} — {}", page_number, chunk_index, e),
        }
    }

    let image = downscale(&chunk.image, ctx.max_chunk_width);
    let label = ChunkLabel {
        page: page_number,
        chunk: chunk_index,
    };
    let text = ctx.invoker.extract_chunk(&image, label, &ctx.progress).await?;
    debug!("Document {}: {} returned {} bytes", ctx.document_id, label, text.len());

    if ctx.save_raw_chunks {
        if let Err(e) = ctx
            .storage
            .write_raw_chunk(&ctx.document_id, page_number, chunk_index, &text)
            .await
        {
            warn!("Could not save raw text of {} — {}", label, e);
        }
    }

    Ok((chunk_index, text))
}

/// The body of `raw/error.txt`: user message, error chain, backtrace.
fn diagnostic_report(message: &str, err: &Pdf2TableError) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{message}\n");
    let _ = writeln!(out, "Error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = writeln!(out, "Caused by: {cause}");
        source = cause.source();
    }
    let _ = writeln!(out, "\nBacktrace:\n{}", Backtrace::force_capture());
    out
}
