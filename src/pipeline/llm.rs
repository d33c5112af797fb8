//! Model invocation: one vision call per chunk, bounded and retried.
//!
//! [`ModelClient`] is the seam between the pipeline and a concrete provider.
//! [`LlmModelClient`] implements it on top of `edgequake-llm`; tests plug in
//! scripted clients.
//!
//! [`ModelInvoker`] wraps a client with the two policies every call goes
//! through:
//!
//! * **Bounded concurrency.** A shared [`Semaphore`] caps the number of calls
//!   in flight across every page and every document handled by the same
//!   invoker. The permit is held for the whole retry loop, backoff sleeps
//!   included, so a throttled chunk does not let a sibling jump the queue and
//!   hit the same quota.
//!
//! * **Quota-aware retry.** Providers like Gemini put the server-mandated
//!   delay in the error text (`"Please retry in 31.18s"`). When present it is
//!   honoured exactly; otherwise the delay is `min(60s, 2s * 2^(attempt-1))`.
//!   While waiting, the document's progress `message` tells pollers what is
//!   going on.

use crate::config::ExtractionConfig;
use crate::error::{ModelError, Pdf2TableError};
use crate::pipeline::encode::encode_chunk;
use crate::progress::{DocumentProgress, ProgressUpdate};
use crate::prompts::table_prompt;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use image::DynamicImage;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Default Gemini model when only `GEMINI_API_KEY` is available.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Extracts table text from one chunk image.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn extract(&self, image: &DynamicImage, prompt: &str) -> Result<String, ModelError>;
}

/// [`ModelClient`] backed by an `edgequake-llm` provider.
pub struct LlmModelClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmModelClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
        }
    }
}

impl fmt::Debug for LlmModelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmModelClient")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModelClient for LlmModelClient {
    /// The request is a single user turn carrying the prompt and the chunk
    /// PNG; tables need no system persona.
    async fn extract(&self, image: &DynamicImage, prompt: &str) -> Result<String, ModelError> {
        let image_data = encode_chunk(image).map_err(|e| ModelError::Encode(e.to_string()))?;
        let messages = vec![ChatMessage::user_with_images(prompt, vec![image_data])];

        let start = Instant::now();
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ModelError::from_provider_message(e.to_string()))?;
        debug!(
            "Model call: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

// ── Provider resolution ──────────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2TableError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2TableError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model` or the
///    Gemini default.
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`.
/// 4. **Gemini** when `GEMINI_API_KEY` is set: the table prompt was tuned on
///    Gemini, so it wins over other keys that happen to be present.
/// 5. **Full auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2TableError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Some(prov), Some(model)) = (
        non_empty_env("EDGEQUAKE_LLM_PROVIDER"),
        non_empty_env("EDGEQUAKE_MODEL"),
    ) {
        return create_vision_provider(&prov, &model);
    }

    if non_empty_env("GEMINI_API_KEY").is_some() {
        let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
        return create_vision_provider("gemini", model);
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2TableError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY (or OPENAI_API_KEY, ANTHROPIC_API_KEY) or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

// ── Retry policy ─────────────────────────────────────────────────────────────

/// How many times to call, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// An explicit provider hint is used verbatim, even above the cap.
    pub fn delay_for(&self, attempt: u32, error: &ModelError) -> Duration {
        if let Some(hint) = error.retry_after() {
            return hint;
        }
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// Page/chunk coordinates of a call, for logs and status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLabel {
    pub page: usize,
    pub chunk: usize,
}

impl fmt::Display for ChunkLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} chunk {}", self.page, self.chunk)
    }
}

fn retry_message(label: ChunkLabel, error: &ModelError, wait: Duration, attempt: u32, max: u32) -> String {
    let secs = wait.as_secs_f64().ceil() as u64;
    if error.is_rate_limited() {
        format!(
            "Rate limited by model provider ({label}). Retrying in {secs}s (attempt {attempt}/{max})…"
        )
    } else {
        format!("Model call failed ({label}). Retrying in {secs}s (attempt {attempt}/{max})…")
    }
}

// ── Invoker ──────────────────────────────────────────────────────────────────

/// A [`ModelClient`] behind a shared concurrency limit and retry loop.
///
/// Cheap to clone; clones share the same semaphore.
#[derive(Clone)]
pub struct ModelInvoker {
    client: Arc<dyn ModelClient>,
    semaphore: Arc<Semaphore>,
    prompt: Arc<str>,
    policy: RetryPolicy,
}

impl fmt::Debug for ModelInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInvoker")
            .field("available_permits", &self.semaphore.available_permits())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ModelInvoker {
    pub fn new(client: Arc<dyn ModelClient>, concurrency: usize, prompt: impl Into<Arc<str>>, policy: RetryPolicy) -> Self {
        Self {
            client,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            prompt: prompt.into(),
            policy,
        }
    }

    /// Build an invoker from the configuration's concurrency, retry and
    /// prompt settings.
    pub fn from_config(client: Arc<dyn ModelClient>, config: &ExtractionConfig) -> Self {
        let prompt = config
            .prompt
            .clone()
            .unwrap_or_else(|| table_prompt(config.delimiter));
        Self::new(client, config.concurrency, prompt, RetryPolicy::from_config(config))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Extract one chunk, retrying per the policy.
    ///
    /// Returns the last error once every attempt has failed. No sleep
    /// follows the final attempt.
    pub async fn extract_chunk(
        &self,
        image: &DynamicImage,
        label: ChunkLabel,
        progress: &DocumentProgress,
    ) -> Result<String, ModelError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ModelError::Api {
                message: "model call limiter was closed".into(),
            })?;

        let max = self.policy.max_attempts;
        let mut attempt = 1;
        loop {
            match self.client.extract(image, &self.prompt).await {
                Ok(text) => {
                    if attempt > 1 {
                        info!("Document {}: {} succeeded on attempt {}", progress.document_id(), label, attempt);
                        progress.update(ProgressUpdate::new().clear_message()).await;
                    }
                    return Ok(text);
                }
                Err(e) if attempt >= max => {
                    warn!(
                        "Document {}: {} failed after {} attempts — {}",
                        progress.document_id(),
                        label,
                        attempt,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let wait = self.policy.delay_for(attempt, &e);
                    warn!(
                        "Document {}: {} attempt {}/{} failed, retrying in {:?} — {}",
                        progress.document_id(),
                        label,
                        attempt,
                        max,
                        wait,
                        e
                    );
                    progress
                        .update(ProgressUpdate::new().message(retry_message(label, &e, wait, attempt, max)))
                        .await;
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStore;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted outcomes; records when each call happened.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<String, ModelError>>>,
        calls: Mutex<Vec<tokio::time::Instant>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        async fn extract(&self, _image: &DynamicImage, _prompt: &str) -> Result<String, ModelError> {
            self.calls.lock().unwrap().push(tokio::time::Instant::now());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ModelError::Api { message: "script exhausted".into() }))
        }
    }

    fn blank() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
    }

    fn api(msg: &str) -> ModelError {
        ModelError::Api { message: msg.into() }
    }

    async fn tracked_doc(id: &str) -> DocumentProgress {
        let handle = ProgressStore::spawn();
        handle.create(id, Some(1)).await.unwrap();
        DocumentProgress::new(handle, id)
    }

    const LABEL: ChunkLabel = ChunkLabel { page: 2, chunk: 3 };

    #[test]
    fn policy_backoff_sequence() {
        let p = RetryPolicy::default();
        let e = api("boom");
        let waits: Vec<u64> = (1..=6).map(|a| p.delay_for(a, &e).as_secs()).collect();
        assert_eq!(waits, vec![2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn policy_uses_hint_verbatim() {
        let p = RetryPolicy::default();
        let e = ModelError::from_provider_message("429 Quota exceeded. Please retry in 90.5s.");
        assert_eq!(p.delay_for(1, &e), Duration::from_secs_f64(90.5));
    }

    #[test]
    fn retry_message_wording() {
        let e = ModelError::from_provider_message("429 rate limit");
        let m = retry_message(LABEL, &e, Duration::from_millis(1500), 1, 6);
        assert_eq!(
            m,
            "Rate limited by model provider (page 2 chunk 3). Retrying in 2s (attempt 1/6)…"
        );
        let m = retry_message(LABEL, &api("x"), Duration::from_secs(4), 2, 6);
        assert!(m.starts_with("Model call failed (page 2 chunk 3)"), "got: {m}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_hint_then_succeeds() {
        let client = Scripted::new(vec![
            Err(ModelError::from_provider_message("429 Too Many Requests. Please retry in 5s.")),
            Ok("a | b".into()),
        ]);
        let invoker = ModelInvoker::new(client.clone(), 1, "p", RetryPolicy::default());
        let doc = tracked_doc("d1").await;

        let out = invoker.extract_chunk(&blank(), LABEL, &doc).await.unwrap();
        assert_eq!(out, "a | b");

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_without_hint() {
        let client = Scripted::new(vec![Err(api("a")), Err(api("b")), Err(api("c")), Ok("ok".into())]);
        let invoker = ModelInvoker::new(client.clone(), 1, "p", RetryPolicy::default());
        let doc = tracked_doc("d2").await;

        invoker.extract_chunk(&blank(), LABEL, &doc).await.unwrap();

        let calls = client.calls.lock().unwrap().clone();
        let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![2, 4, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_without_trailing_sleep() {
        let client = Scripted::new((0..6).map(|i| Err(api(&format!("fail {i}")))).collect());
        let invoker = ModelInvoker::new(client.clone(), 1, "p", RetryPolicy::default());
        let doc = tracked_doc("d3").await;

        let start = tokio::time::Instant::now();
        let err = invoker.extract_chunk(&blank(), LABEL, &doc).await.unwrap_err();
        assert!(err.to_string().contains("fail 5"), "got: {err}");
        assert_eq!(client.calls.lock().unwrap().len(), 6);
        // 2 + 4 + 8 + 16 + 32, nothing after the sixth call.
        assert_eq!(start.elapsed(), Duration::from_secs(62));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_message_shown_then_cleared() {
        let client = Scripted::new(vec![
            Err(ModelError::from_provider_message("429 rate limit. retry in 3s")),
            Ok("x".into()),
        ]);
        let invoker = ModelInvoker::new(client, 1, "p", RetryPolicy::default());
        let doc = tracked_doc("d4").await;
        let handle = doc.clone();

        let call = tokio::spawn({
            let invoker = invoker.clone();
            async move { invoker.extract_chunk(&blank(), LABEL, &handle).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mid = doc_state(&doc).await;
        assert!(
            mid.message.as_deref().unwrap_or_default().contains("Retrying in 3s (attempt 1/6)"),
            "got: {:?}",
            mid.message
        );

        call.await.unwrap().unwrap();
        assert_eq!(doc_state(&doc).await.message, None);
    }

    async fn doc_state(doc: &DocumentProgress) -> crate::progress::ProgressState {
        // An empty update returns the current record unchanged.
        doc.update(ProgressUpdate::new()).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn success_without_retry_keeps_message() {
        let client = Scripted::new(vec![Ok("x".into())]);
        let invoker = ModelInvoker::new(client, 1, "p", RetryPolicy::default());
        let doc = tracked_doc("d5").await;
        doc.update(ProgressUpdate::new().message("hello")).await;

        invoker.extract_chunk(&blank(), LABEL, &doc).await.unwrap();
        assert_eq!(doc_state(&doc).await.message.as_deref(), Some("hello"));
    }

    struct Slow {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for Slow {
        async fn extract(&self, _image: &DynamicImage, _prompt: &str) -> Result<String, ModelError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let client = Arc::new(Slow {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let invoker = ModelInvoker::new(client.clone(), 2, "p", RetryPolicy::default());
        let doc = tracked_doc("d6").await;

        let mut set = tokio::task::JoinSet::new();
        for chunk in 1..=8 {
            let invoker = invoker.clone();
            let doc = doc.clone();
            set.spawn(async move {
                invoker
                    .extract_chunk(&blank(), ChunkLabel { page: 1, chunk }, &doc)
                    .await
            });
        }
        while let Some(res) = set.join_next().await {
            res.unwrap().unwrap();
        }
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prompt_defaults_to_table_prompt() {
        let config = ExtractionConfig::builder().delimiter(';').build().unwrap();
        let client = Scripted::new(vec![]);
        let invoker = ModelInvoker::from_config(client, &config);
        assert_eq!(&*invoker.prompt, table_prompt(';'));
        assert_eq!(invoker.policy().max_attempts, 6);
    }
}
