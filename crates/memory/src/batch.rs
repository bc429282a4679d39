//! Batch embedding dispatch: token-bounded batches, bounded concurrency,
//! retry with exponential backoff and a failure circuit breaker.

use std::{sync::Arc, time::Duration};

use {
    futures::{StreamExt, stream},
    serde::Serialize,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    config::{BatchSettings, EMBEDDING_APPROX_CHARS_PER_TOKEN},
    embeddings::{EmbeddingProvider, Fingerprint},
    error::EmbeddingError,
    provider::ProviderSelector,
    store::ChunkEmbedding,
};

/// A chunk waiting for its vector.
#[derive(Debug, Clone)]
pub struct PendingEmbedding {
    pub id: String,
    pub hash: String,
    pub text: String,
}

impl PendingEmbedding {
    fn approx_tokens(&self) -> usize {
        self.text
            .chars()
            .count()
            .div_ceil(EMBEDDING_APPROX_CHARS_PER_TOKEN)
            .max(1)
    }
}

/// Group items into batches of at most `max_tokens`, preserving order. A
/// single item over budget becomes its own batch; items are never split.
pub fn build_batches(items: Vec<PendingEmbedding>, max_tokens: usize) -> Vec<Vec<PendingEmbedding>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0usize;
    for item in items {
        let tokens = item.approx_tokens();
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Circuit breaker over consecutive fully-failed batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Breaker {
    Closed {
        failures: usize,
        last_error: Option<String>,
    },
    Open {
        failures: usize,
        reason: String,
    },
}

impl Breaker {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::Closed {
            failures: 0,
            last_error: None,
        }
    }
}

/// What one dispatch achieved.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Embedding space of every vector in `embedded`.
    pub fingerprint: Option<Fingerprint>,
    pub embedded: Vec<ChunkEmbedding>,
    pub batches_ok: usize,
    pub batches_failed: usize,
    /// Items left without a vector.
    pub unembedded: usize,
    /// Dispatch was skipped because the breaker is open or no provider is left.
    pub skipped: bool,
    pub cancelled: bool,
    /// The provider was replaced after a permanent failure.
    pub demoted: bool,
    pub errors: Vec<String>,
}

enum BatchResult {
    Embedded(Vec<ChunkEmbedding>),
    Failed { items: usize, error: EmbeddingError },
    Demoted { items: usize, error: EmbeddingError },
    Skipped(usize),
    Cancelled(usize),
}

pub struct BatchDispatcher {
    settings: BatchSettings,
    breaker: Mutex<Breaker>,
}

impl BatchDispatcher {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            breaker: Mutex::new(Breaker::default()),
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub async fn breaker(&self) -> Breaker {
        self.breaker.lock().await.clone()
    }

    pub async fn reset_breaker(&self) {
        *self.breaker.lock().await = Breaker::default();
        info!("embedding circuit breaker reset");
    }

    /// Backoff before attempt `attempt + 1` (1-based `attempt`).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.settings
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.settings.retry_max_delay)
    }

    fn timeout_for(&self, provider: &dyn EmbeddingProvider) -> Duration {
        if provider.kind().is_local() {
            self.settings.local_timeout
        } else {
            self.settings.remote_timeout
        }
    }

    /// Embed `items` with the selector's active provider.
    pub async fn dispatch(
        &self,
        selector: &ProviderSelector,
        items: Vec<PendingEmbedding>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if items.is_empty() {
            return report;
        }
        let total = items.len();
        if !self.settings.enabled {
            report.skipped = true;
            report.unembedded = total;
            return report;
        }
        if self.breaker.lock().await.is_open() {
            debug!(items = total, "circuit breaker open, skipping embedding dispatch");
            report.skipped = true;
            report.unembedded = total;
            return report;
        }
        let Some(provider) = selector.current().await else {
            report.skipped = true;
            report.unembedded = total;
            return report;
        };
        report.fingerprint = Some(Fingerprint::of(provider.as_ref()));

        let batches = build_batches(items, self.settings.max_tokens);
        debug!(
            items = total,
            batches = batches.len(),
            provider = %provider.kind(),
            "dispatching embedding batches"
        );

        let results: Vec<BatchResult> = stream::iter(batches)
            .map(|batch| self.run_batch(selector, Arc::clone(&provider), batch, cancel))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                BatchResult::Embedded(vectors) => {
                    report.batches_ok += 1;
                    report.embedded.extend(vectors);
                },
                BatchResult::Failed { items, error } => {
                    report.batches_failed += 1;
                    report.unembedded += items;
                    report.errors.push(error.to_string());
                },
                BatchResult::Demoted { items, error } => {
                    report.batches_failed += 1;
                    report.unembedded += items;
                    report.demoted = true;
                    report.errors.push(error.to_string());
                },
                BatchResult::Skipped(items) => {
                    report.skipped = true;
                    report.unembedded += items;
                },
                BatchResult::Cancelled(items) => {
                    report.cancelled = true;
                    report.unembedded += items;
                },
            }
        }
        report
    }

    async fn run_batch(
        &self,
        selector: &ProviderSelector,
        provider: Arc<dyn EmbeddingProvider>,
        batch: Vec<PendingEmbedding>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        let timeout = self.timeout_for(provider.as_ref());
        let mut attempt = 0u32;

        let error = loop {
            // Another batch may have tripped the breaker while this one was queued.
            if self.breaker.lock().await.is_open() {
                return BatchResult::Skipped(batch.len());
            }
            attempt += 1;
            let call = tokio::time::timeout(timeout, provider.embed_batch(&texts));
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return BatchResult::Cancelled(batch.len()),
                r = call => r,
            };
            let err = match outcome {
                Ok(Ok(vectors)) if vectors.len() == batch.len() => {
                    self.record_success().await;
                    return BatchResult::Embedded(
                        batch
                            .into_iter()
                            .zip(vectors)
                            .map(|(item, embedding)| ChunkEmbedding {
                                id: item.id,
                                hash: item.hash,
                                embedding,
                            })
                            .collect(),
                    );
                },
                Ok(Ok(vectors)) => EmbeddingError::Unknown(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )),
                Ok(Err(e)) => e,
                Err(_) => EmbeddingError::Timeout(timeout),
            };

            if !err.is_retryable() || attempt >= self.settings.max_attempts {
                break err;
            }
            let delay = self.backoff(attempt);
            warn!(
                attempt,
                max_attempts = self.settings.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "embedding batch failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return BatchResult::Cancelled(batch.len()),
                _ = tokio::time::sleep(delay) => {},
            }
        };

        if error.is_permanent_outage() {
            let failed = provider.kind();
            if let Some(next) = selector.fall_back(failed, &error).await {
                // The replacement starts with a clean breaker.
                *self.breaker.lock().await = Breaker::default();
                info!(from = %failed, to = %next.kind(), "embedding provider replaced");
                return BatchResult::Demoted {
                    items: batch.len(),
                    error,
                };
            }
        }
        self.record_failure(&error).await;
        BatchResult::Failed {
            items: batch.len(),
            error,
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        if let Breaker::Closed { failures, .. } = &*breaker
            && *failures > 0
        {
            debug!(failures, "embedding batch succeeded, failure counter reset");
        }
        if !breaker.is_open() {
            *breaker = Breaker::default();
        }
    }

    async fn record_failure(&self, error: &EmbeddingError) {
        let mut breaker = self.breaker.lock().await;
        let failures = match &*breaker {
            Breaker::Closed { failures, .. } => failures + 1,
            Breaker::Open { .. } => return,
        };
        if failures >= self.settings.failure_limit.max(1) {
            warn!(
                failures,
                error = %error,
                "embedding circuit breaker open, indexing continues lexical-only"
            );
            *breaker = Breaker::Open {
                failures,
                reason: error.to_string(),
            };
        } else {
            *breaker = Breaker::Closed {
                failures,
                last_error: Some(error.to_string()),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::MemoryConfig, embeddings::ProviderKind},
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    /// Provider scripted to fail its first `fail_first` calls with `error`.
    struct Scripted {
        kind: ProviderKind,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_first: usize,
        error: Option<EmbeddingError>,
        delay: Duration,
    }

    impl Scripted {
        fn ok() -> Self {
            Self {
                kind: ProviderKind::OpenAi,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_first: 0,
                error: None,
                delay: Duration::ZERO,
            }
        }

        fn failing(error: EmbeddingError, fail_first: usize) -> Self {
            Self {
                fail_first,
                error: Some(error),
                ..Self::ok()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Scripted {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match &self.error {
                Some(e) if n < self.fail_first => Err(e.clone()),
                _ => Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect()),
            }
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider_key(&self) -> &str {
            self.kind.as_str()
        }
    }

    fn settings() -> BatchSettings {
        let mut s = MemoryConfig::for_workspace("t", "/tmp").batch;
        s.retry_base_delay = Duration::from_millis(1);
        s.retry_max_delay = Duration::from_millis(4);
        // One item per batch.
        s.max_tokens = 1;
        s
    }

    async fn selector_with(providers: Vec<Arc<Scripted>>) -> ProviderSelector {
        let selector = ProviderSelector::new(
            "auto",
            providers
                .into_iter()
                .map(|p| p as Arc<dyn EmbeddingProvider>)
                .collect(),
            Duration::from_secs(1),
        );
        selector.resolve().await.unwrap();
        selector
    }

    fn items(n: usize) -> Vec<PendingEmbedding> {
        (0..n)
            .map(|i| PendingEmbedding {
                id: format!("c{i}"),
                hash: format!("h{i}"),
                text: format!("chunk number {i}"),
            })
            .collect()
    }

    fn rate_limited() -> EmbeddingError {
        EmbeddingError::RateLimited {
            provider: "openai".into(),
            message: "429".into(),
        }
    }

    #[test]
    fn batches_respect_token_budget() {
        let mut input = items(3);
        input[1].text = "x".repeat(50);
        let batches = build_batches(input, 30);
        // c0 (14) fits, the oversized c1 stands alone, c2 starts a new batch.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[1][0].id, "c1");

        let packed = build_batches(items(4), 1_000);
        assert_eq!(packed.len(), 1);
        let ids: Vec<&str> = packed[0].iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3"]);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let d = BatchDispatcher::new(settings());
        assert_eq!(d.backoff(1), Duration::from_millis(1));
        assert_eq!(d.backoff(2), Duration::from_millis(2));
        assert_eq!(d.backoff(3), Duration::from_millis(4));
        assert_eq!(d.backoff(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(Scripted::failing(rate_limited(), 2));
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let d = BatchDispatcher::new(settings());

        let report = d.dispatch(&selector, items(1), &CancellationToken::new()).await;
        assert_eq!(report.batches_ok, 1);
        assert_eq!(report.embedded.len(), 1);
        assert_eq!(provider.calls(), 3);
        assert_eq!(d.breaker().await, Breaker::default());
    }

    #[tokio::test]
    async fn invalid_input_is_not_retried() {
        let provider = Arc::new(Scripted::failing(
            EmbeddingError::InvalidInput {
                provider: "openai".into(),
                message: "too long".into(),
            },
            usize::MAX,
        ));
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let d = BatchDispatcher::new(settings());

        let report = d.dispatch(&selector, items(1), &CancellationToken::new()).await;
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.unembedded, 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_limit_and_stays_open() {
        let provider = Arc::new(Scripted::failing(rate_limited(), usize::MAX));
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let mut s = settings();
        s.concurrency = 1;
        s.max_attempts = 1;
        s.failure_limit = 2;
        let d = BatchDispatcher::new(s);

        let report = d.dispatch(&selector, items(4), &CancellationToken::new()).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(report.batches_failed, 2);
        assert_eq!(report.unembedded, 4);
        assert!(d.breaker().await.is_open());

        // Later passes make no calls at all.
        let report = d.dispatch(&selector, items(3), &CancellationToken::new()).await;
        assert!(report.skipped);
        assert_eq!(provider.calls(), 2);

        d.reset_breaker().await;
        d.dispatch(&selector, items(1), &CancellationToken::new()).await;
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        // Fails once (one batch fully failed), then succeeds.
        let provider = Arc::new(Scripted::failing(rate_limited(), 1));
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let mut s = settings();
        s.concurrency = 1;
        s.max_attempts = 1;
        s.failure_limit = 2;
        let d = BatchDispatcher::new(s);

        let report = d.dispatch(&selector, items(3), &CancellationToken::new()).await;
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.batches_ok, 2);
        assert!(!d.breaker().await.is_open());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let provider = Arc::new(Scripted {
            delay: Duration::from_millis(20),
            ..Scripted::ok()
        });
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let mut s = settings();
        s.concurrency = 2;
        let d = BatchDispatcher::new(s);

        let report = d.dispatch(&selector, items(8), &CancellationToken::new()).await;
        assert_eq!(report.batches_ok, 8);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let provider = Arc::new(Scripted {
            delay: Duration::from_secs(30),
            ..Scripted::ok()
        });
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let mut s = settings();
        s.remote_timeout = Duration::from_millis(20);
        s.max_attempts = 1;
        let d = BatchDispatcher::new(s);

        let report = d.dispatch(&selector, items(1), &CancellationToken::new()).await;
        assert_eq!(report.batches_failed, 1);
        assert!(report.errors[0].contains("timed out"));
    }

    #[tokio::test]
    async fn permanent_outage_demotes_provider() {
        let primary = Arc::new(Scripted::failing(
            EmbeddingError::Unavailable {
                provider: "openai".into(),
                message: "key revoked".into(),
                transient: false,
            },
            usize::MAX,
        ));
        let backup = Arc::new(Scripted {
            kind: ProviderKind::Local,
            ..Scripted::ok()
        });
        let selector = selector_with(vec![Arc::clone(&primary), Arc::clone(&backup)]).await;
        let d = BatchDispatcher::new(settings());

        let report = d.dispatch(&selector, items(1), &CancellationToken::new()).await;
        assert!(report.demoted);
        assert_eq!(primary.calls(), 1);
        assert_eq!(
            selector.current().await.map(|p| p.kind()),
            Some(ProviderKind::Local)
        );
        assert!(!d.breaker().await.is_open());
    }

    #[tokio::test]
    async fn cancelled_dispatch_makes_no_calls() {
        let provider = Arc::new(Scripted::ok());
        let selector = selector_with(vec![Arc::clone(&provider)]).await;
        let d = BatchDispatcher::new(settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = d.dispatch(&selector, items(2), &cancel).await;
        assert!(report.cancelled);
        assert_eq!(report.unembedded, 2);
        assert_eq!(provider.calls(), 0);
    }
}
