//! Application context: the one object a front-end holds.
//!
//! [`AppContext`] bundles the [`DocumentProcessor`] (renderer, model,
//! storage, progress store) with a [`TaskRegistry`] of running documents.
//! It is constructed once and shared by reference; there is no process-wide
//! state, so tests build their own context around fakes.
//!
//! ## Supervised tasks
//!
//! `submit` validates the PDF, creates the progress record and returns
//! immediately; processing continues on a Tokio task that the registry keeps
//! by document id. Callers can [`AppContext::wait`] for it,
//! [`AppContext::cancel`] it, or [`AppContext::shutdown`] everything. The
//! registry aborts whatever is still running when it is dropped.

use crate::config::ExtractionConfig;
use crate::error::Pdf2TableError;
use crate::output::{GlobalTable, PageTable};
use crate::pipeline::input::check_pdf_magic;
use crate::pipeline::llm::{resolve_provider, LlmModelClient, ModelInvoker};
use crate::pipeline::render::PdfiumRenderer;
use crate::processor::DocumentProcessor;
use crate::progress::{DocumentState, ProgressHandle, ProgressState, ProgressStore, ProgressUpdate};
use crate::storage::FilesystemStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message stored on a document cancelled before it finished.
pub const CANCELLED_MESSAGE: &str = "Processing cancelled.";

/// Receipt for an accepted upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub document_id: String,
    pub num_pages: usize,
    pub state: DocumentState,
    pub created_at: DateTime<Utc>,
}

struct TaskEntry {
    handle: JoinHandle<DocumentState>,
    outcome: watch::Receiver<Option<DocumentState>>,
}

/// Running document tasks, keyed by document id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

/// How a supervised task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished(DocumentState),
    Aborted,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
        // A poisoned map still holds valid handles.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn `work` under `document_id`, reaping finished entries first.
    pub fn spawn<F>(&self, document_id: &str, work: F)
    where
        F: Future<Output = DocumentState> + Send + 'static,
    {
        let (tx, outcome) = watch::channel(None);
        let handle = tokio::spawn(async move {
            let state = work.await;
            let _ = tx.send(Some(state));
            state
        });

        let mut tasks = self.lock();
        tasks.retain(|_, entry| !entry.handle.is_finished());
        if let Some(previous) = tasks.insert(document_id.to_string(), TaskEntry { handle, outcome }) {
            warn!("Document {}: replacing a running task", document_id);
            previous.handle.abort();
        }
    }

    /// Whether a task for `document_id` is still running.
    pub fn is_running(&self, document_id: &str) -> bool {
        self.lock()
            .get(document_id)
            .is_some_and(|e| !e.handle.is_finished())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for the task to end. `None` when no task is registered.
    pub async fn wait(&self, document_id: &str) -> Option<TaskOutcome> {
        let mut outcome = self.lock().get(document_id)?.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(state) => match *state {
                Some(s) => TaskOutcome::Finished(s),
                None => TaskOutcome::Aborted,
            },
            // Sender dropped without a value: the task was aborted.
            Err(_) => TaskOutcome::Aborted,
        };
        Some(result)
    }

    /// Abort the task and wait until it has stopped. Returns false when no
    /// running task was registered.
    pub async fn cancel(&self, document_id: &str) -> bool {
        let entry = self.lock().remove(document_id);
        match entry {
            Some(entry) if !entry.handle.is_finished() => {
                entry.handle.abort();
                let _ = entry.handle.await;
                debug!("Document {}: task aborted", document_id);
                true
            }
            _ => false,
        }
    }

    /// Abort every task and wait for all of them to stop.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, TaskEntry)> = self.lock().drain().collect();
        if !entries.is_empty() {
            info!("Shutting down {} document task(s)", entries.len());
        }
        for (_, entry) in &entries {
            entry.handle.abort();
        }
        for (_, entry) in entries {
            let _ = entry.handle.await;
        }
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        for entry in self.lock().values() {
            entry.handle.abort();
        }
    }
}

/// Everything a front-end needs to run and observe extractions.
pub struct AppContext {
    processor: Arc<DocumentProcessor>,
    tasks: TaskRegistry,
}

impl AppContext {
    /// Wrap an already assembled processor.
    pub fn new(processor: DocumentProcessor) -> Self {
        Self {
            processor: Arc::new(processor),
            tasks: TaskRegistry::new(),
        }
    }

    /// Assemble the production stack: pdfium renderer, `edgequake-llm`
    /// model, filesystem storage under `config.storage_dir`, and a fresh
    /// progress store.
    ///
    /// A provider that cannot be configured does not fail construction;
    /// every document submitted afterwards fails with the reason instead.
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: ExtractionConfig) -> Self {
        let renderer = Arc::new(PdfiumRenderer::new(
            config.pdfium_library_path.clone(),
            config.max_rendered_pixels,
        ));
        let model = match resolve_provider(&config) {
            Ok(provider) => {
                debug!("Model provider resolved");
                let client = Arc::new(LlmModelClient::new(provider, &config));
                Ok(ModelInvoker::from_config(client, &config))
            }
            Err(e) => {
                warn!("No model provider configured — {}", e);
                Err(e.to_string())
            }
        };
        let storage = Arc::new(FilesystemStorage::new(config.storage_dir.clone()));
        let progress = ProgressStore::spawn();
        Self::new(DocumentProcessor::new(renderer, model, storage, progress, config))
    }

    pub fn processor(&self) -> &DocumentProcessor {
        &self.processor
    }

    pub fn progress(&self) -> &ProgressHandle {
        self.processor.progress()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Validate a PDF, register it and start processing in the background.
    ///
    /// Input errors (not a PDF, corrupt, encrypted without the right
    /// password) are returned before any document state exists.
    pub async fn submit(
        &self,
        pdf: impl Into<Arc<[u8]>>,
        password: Option<String>,
    ) -> Result<Submission, Pdf2TableError> {
        let pdf: Arc<[u8]> = pdf.into();
        check_pdf_magic(&pdf)?;
        let num_pages = self
            .processor
            .renderer()
            .page_count(Arc::clone(&pdf), password.clone())
            .await?;

        let document_id = Uuid::new_v4().simple().to_string();
        let state = self.progress().create(&document_id, Some(num_pages)).await?;
        info!("Document {}: accepted ({} pages)", document_id, num_pages);

        let processor = Arc::clone(&self.processor);
        let id = document_id.clone();
        self.tasks.spawn(&document_id, async move {
            processor.process(&id, pdf, password).await
        });

        Ok(Submission {
            document_id,
            num_pages,
            state: state.state,
            created_at: state.created_at,
        })
    }

    /// Current progress record, `None` for unknown ids.
    pub async fn status(&self, document_id: &str) -> Result<Option<ProgressState>, Pdf2TableError> {
        Ok(self.progress().get(document_id).await?)
    }

    /// Every known document, oldest first.
    pub async fn documents(&self) -> Result<Vec<ProgressState>, Pdf2TableError> {
        Ok(self.progress().list().await?)
    }

    pub async fn page_table(
        &self,
        document_id: &str,
        page_number: usize,
    ) -> Result<Option<PageTable>, Pdf2TableError> {
        Ok(self
            .processor
            .storage()
            .read_page_table(document_id, page_number)
            .await?)
    }

    pub async fn global_table(&self, document_id: &str) -> Result<Option<GlobalTable>, Pdf2TableError> {
        Ok(self.processor.storage().read_global_table(document_id).await?)
    }

    pub async fn page_image_path(&self, document_id: &str, page_number: usize) -> Option<PathBuf> {
        self.processor
            .storage()
            .page_image_path(document_id, page_number)
            .await
    }

    /// Wait until the document reaches a terminal state and return it.
    pub async fn wait(&self, document_id: &str) -> Result<ProgressState, Pdf2TableError> {
        if let Some(TaskOutcome::Aborted) = self.tasks.wait(document_id).await {
            debug!("Document {}: waited on an aborted task", document_id);
        }
        match self.progress().get(document_id).await? {
            Some(state) if state.is_terminal() => Ok(state),
            Some(_) => Err(Pdf2TableError::Cancelled {
                document_id: document_id.to_string(),
            }),
            None => Err(Pdf2TableError::Progress(
                crate::error::ProgressError::UnknownDocument(document_id.to_string()),
            )),
        }
    }

    /// Stop processing a document and mark it failed.
    ///
    /// Returns false when there was nothing running to cancel.
    pub async fn cancel(&self, document_id: &str) -> Result<bool, Pdf2TableError> {
        if !self.tasks.cancel(document_id).await {
            return Ok(false);
        }
        let marked = self
            .progress()
            .update(
                document_id,
                ProgressUpdate::new()
                    .state(DocumentState::Failed)
                    .message(CANCELLED_MESSAGE)
                    .current_page(None)
                    .current_chunk(None),
            )
            .await;
        match marked {
            Ok(_) => info!("Document {}: cancelled", document_id),
            // The task reached a terminal state before the abort landed.
            Err(e) => debug!("Document {}: not marked cancelled — {}", document_id, e),
        }
        Ok(true)
    }

    /// Abort all running documents. Their records are left as they were.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }
}
