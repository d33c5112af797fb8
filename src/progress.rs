//! Document progress tracking.
//!
//! Every document has one [`ProgressState`] record, created at submission
//! time and mutated only by the orchestrator while pollers read it.
//!
//! # Single-owner store
//!
//! The records live inside a [`ProgressStore`] task that owns the map
//! outright. Callers talk to it through a cloneable [`ProgressHandle`] that
//! sends a request over an mpsc channel and awaits the reply on a oneshot.
//! Because the store handles one request at a time, each update is validated
//! and applied in full before any reader can observe the record, without a
//! lock around read-modify-write sequences.
//!
//! # State machine
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!    │            │
//!    └────────────┴───────▶ failed
//! ```
//!
//! No transition leaves a terminal state. `progress` never decreases, except
//! in the same update that moves the document to `failed`.

use crate::error::ProgressError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Lifecycle state of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl DocumentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Completed | DocumentState::Failed)
    }

    /// Whether `self → next` is an edge of the state machine. Re-asserting
    /// the current non-terminal state is allowed.
    pub fn can_transition_to(self, next: DocumentState) -> bool {
        use DocumentState::*;
        match (self, next) {
            (a, b) if a == b => !a.is_terminal(),
            (Queued, Processing) | (Queued, Failed) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentState::Queued => "queued",
            DocumentState::Processing => "processing",
            DocumentState::Completed => "completed",
            DocumentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The pollable record describing a document's pipeline lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub document_id: String,
    pub state: DocumentState,
    /// Percentage of chunks extracted, `0..=100`.
    pub progress: u8,
    pub current_page: Option<usize>,
    pub current_chunk: Option<usize>,
    pub total_pages: Option<usize>,
    pub total_chunks: Option<usize>,
    /// Human-readable status (retry notices, failure reason).
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressState {
    pub fn new(document_id: impl Into<String>, total_pages: Option<usize>) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id.into(),
            state: DocumentState::Queued,
            progress: 0,
            current_page: None,
            current_chunk: None,
            total_pages,
            total_chunks: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Validate `update` against the state machine, then apply it.
    ///
    /// Nothing is modified when validation fails.
    pub fn apply(&mut self, update: &ProgressUpdate) -> Result<(), ProgressError> {
        if self.state.is_terminal() {
            return Err(ProgressError::TerminalState {
                document_id: self.document_id.clone(),
                state: self.state,
            });
        }
        if let Some(next) = update.state {
            if !self.state.can_transition_to(next) {
                return Err(ProgressError::InvalidTransition {
                    from: self.state,
                    to: next,
                });
            }
        }
        if let Some(p) = update.progress {
            if p > 100 {
                return Err(ProgressError::ProgressOutOfRange(p));
            }
            let failing = update.state == Some(DocumentState::Failed);
            if p < self.progress && !failing {
                return Err(ProgressError::ProgressRegression {
                    from: self.progress,
                    to: p,
                });
            }
        }

        if let Some(s) = update.state {
            self.state = s;
        }
        if let Some(p) = update.progress {
            self.progress = p;
        }
        if let Some(v) = update.current_page {
            self.current_page = v;
        }
        if let Some(v) = update.current_chunk {
            self.current_chunk = v;
        }
        if let Some(v) = update.total_pages {
            self.total_pages = v;
        }
        if let Some(v) = update.total_chunks {
            self.total_chunks = v;
        }
        if let Some(ref v) = update.message {
            self.message = v.clone();
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A typed partial update: `None` leaves a field untouched, `Some(None)`
/// clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub state: Option<DocumentState>,
    pub progress: Option<u8>,
    pub current_page: Option<Option<usize>>,
    pub current_chunk: Option<Option<usize>>,
    pub total_pages: Option<Option<usize>>,
    pub total_chunks: Option<Option<usize>>,
    pub message: Option<Option<String>>,
}

impl ProgressUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: DocumentState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_page(mut self, page: Option<usize>) -> Self {
        self.current_page = Some(page);
        self
    }

    pub fn current_chunk(mut self, chunk: Option<usize>) -> Self {
        self.current_chunk = Some(chunk);
        self
    }

    pub fn totals(mut self, pages: usize, chunks: usize) -> Self {
        self.total_pages = Some(Some(pages));
        self.total_chunks = Some(Some(chunks));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(Some(message.into()));
        self
    }

    pub fn clear_message(mut self) -> Self {
        self.message = Some(None);
        self
    }
}

/// `round(100 * done / total)`, clamped to 100. A zero total counts as done.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

// ── Store ────────────────────────────────────────────────────────────────────

enum Request {
    Create {
        document_id: String,
        total_pages: Option<usize>,
        reply: oneshot::Sender<ProgressState>,
    },
    Get {
        document_id: String,
        reply: oneshot::Sender<Option<ProgressState>>,
    },
    Update {
        document_id: String,
        update: ProgressUpdate,
        reply: oneshot::Sender<Result<ProgressState, ProgressError>>,
    },
    List {
        reply: oneshot::Sender<Vec<ProgressState>>,
    },
}

/// Owns every progress record; runs as its own task until all handles drop.
///
/// Records are kept for the lifetime of the process.
pub struct ProgressStore {
    states: HashMap<String, ProgressState>,
    requests: mpsc::Receiver<Request>,
}

impl ProgressStore {
    /// Spawn the store on the current Tokio runtime and return a handle.
    pub fn spawn() -> ProgressHandle {
        let (sender, requests) = mpsc::channel(256);
        let store = ProgressStore {
            states: HashMap::new(),
            requests,
        };
        tokio::spawn(store.run());
        ProgressHandle { sender }
    }

    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }
        debug!("Progress request channel closed; store stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Create {
                document_id,
                total_pages,
                reply,
            } => {
                let state = ProgressState::new(document_id.clone(), total_pages);
                self.states.insert(document_id, state.clone());
                let _ = reply.send(state);
            }
            Request::Get { document_id, reply } => {
                let _ = reply.send(self.states.get(&document_id).cloned());
            }
            Request::Update {
                document_id,
                update,
                reply,
            } => {
                let result = match self.states.get_mut(&document_id) {
                    Some(state) => state.apply(&update).map(|_| state.clone()),
                    None => Err(ProgressError::UnknownDocument(document_id)),
                };
                let _ = reply.send(result);
            }
            Request::List { reply } => {
                let mut all: Vec<ProgressState> = self.states.values().cloned().collect();
                all.sort_by_key(|s| s.created_at);
                let _ = reply.send(all);
            }
        }
    }
}

/// Cloneable client of the [`ProgressStore`].
#[derive(Clone, Debug)]
pub struct ProgressHandle {
    sender: mpsc::Sender<Request>,
}

impl ProgressHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ProgressError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| ProgressError::StoreClosed)?;
        rx.await.map_err(|_| ProgressError::StoreClosed)
    }

    /// Create (or reset) the record for `document_id` in the `queued` state.
    pub async fn create(
        &self,
        document_id: &str,
        total_pages: Option<usize>,
    ) -> Result<ProgressState, ProgressError> {
        let document_id = document_id.to_string();
        self.call(|reply| Request::Create {
            document_id,
            total_pages,
            reply,
        })
        .await
    }

    /// Snapshot of one record.
    pub async fn get(&self, document_id: &str) -> Result<Option<ProgressState>, ProgressError> {
        let document_id = document_id.to_string();
        self.call(|reply| Request::Get { document_id, reply }).await
    }

    /// Apply a validated partial update and return the resulting record.
    pub async fn update(
        &self,
        document_id: &str,
        update: ProgressUpdate,
    ) -> Result<ProgressState, ProgressError> {
        let document_id = document_id.to_string();
        self.call(|reply| Request::Update {
            document_id,
            update,
            reply,
        })
        .await?
    }

    /// Every record, oldest first.
    pub async fn list(&self) -> Result<Vec<ProgressState>, ProgressError> {
        self.call(|reply| Request::List { reply }).await
    }
}

/// A [`ProgressHandle`] bound to one document, used inside the pipeline.
///
/// Updates through this type are best-effort: a rejected update is logged
/// and does not interrupt extraction.
#[derive(Clone, Debug)]
pub struct DocumentProgress {
    handle: ProgressHandle,
    document_id: Arc<str>,
}

impl DocumentProgress {
    pub fn new(handle: ProgressHandle, document_id: &str) -> Self {
        Self {
            handle,
            document_id: Arc::from(document_id),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub async fn update(&self, update: ProgressUpdate) -> Option<ProgressState> {
        match self.handle.update(&self.document_id, update).await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Document {}: progress update rejected — {}", self.document_id, e);
                None
            }
        }
    }
}
