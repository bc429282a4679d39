//! Embedding provider selection with sticky fallback.
//!
//! Candidates are probed in preference order. The first healthy one becomes
//! active and stays active for the lifetime of the selector: a later recovery of
//! a higher-preference provider never switches back. Only [`ProviderSelector::reset`]
//! re-probes from the top.

use std::{sync::Arc, time::Duration};

use {
    recall_config::schema::{FallbackChoice, ProviderChoice},
    serde::Serialize,
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use crate::{
    config::ProviderSettings,
    embeddings::{EmbeddingProvider, ProviderKind},
    embeddings_gemini::GeminiEmbeddingProvider,
    embeddings_local::LocalEmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
    error::{EmbeddingError, MemoryError, Result},
};

/// Where the selector currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProviderState {
    /// Not probed yet.
    Unresolved,
    /// The most preferred candidate is active.
    Primary,
    /// A lower-preference candidate is active because `from` failed.
    Fallback { from: ProviderKind, reason: String },
    /// Every candidate failed.
    Exhausted { reason: String },
}

/// Serializable view of the selector for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub requested: String,
    pub active: Option<ProviderKind>,
    pub model: Option<String>,
    pub state: ProviderState,
}

struct Selection {
    /// Index of the first candidate still eligible for activation.
    cursor: usize,
    active: Option<usize>,
    state: ProviderState,
}

pub struct ProviderSelector {
    requested: String,
    candidates: Vec<Arc<dyn EmbeddingProvider>>,
    probe_timeout: Duration,
    selection: Mutex<Selection>,
}

impl ProviderSelector {
    /// Build a selector over explicit candidates, most preferred first.
    pub fn new(
        requested: impl Into<String>,
        candidates: Vec<Arc<dyn EmbeddingProvider>>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            requested: requested.into(),
            candidates,
            probe_timeout,
            selection: Mutex::new(Selection {
                cursor: 0,
                active: None,
                state: ProviderState::Unresolved,
            }),
        }
    }

    /// Candidates from configuration: auto order, or the requested provider
    /// followed by its configured fallback.
    pub fn from_settings(settings: &ProviderSettings, probe_timeout: Duration) -> Self {
        let kinds: Vec<ProviderKind> = match settings.requested {
            ProviderChoice::Auto => ProviderKind::AUTO_ORDER.to_vec(),
            explicit => {
                let primary = match explicit {
                    ProviderChoice::OpenAi => ProviderKind::OpenAi,
                    ProviderChoice::Gemini => ProviderKind::Gemini,
                    _ => ProviderKind::Local,
                };
                let fallback = match settings.fallback {
                    FallbackChoice::OpenAi => Some(ProviderKind::OpenAi),
                    FallbackChoice::Gemini => Some(ProviderKind::Gemini),
                    FallbackChoice::Local => Some(ProviderKind::Local),
                    FallbackChoice::None => None,
                };
                std::iter::once(primary)
                    .chain(fallback.filter(|f| *f != primary))
                    .collect()
            },
        };
        let candidates = kinds
            .into_iter()
            .map(|kind| -> Arc<dyn EmbeddingProvider> {
                match kind {
                    ProviderKind::OpenAi => {
                        Arc::new(OpenAiEmbeddingProvider::from_settings(&settings.openai))
                    },
                    ProviderKind::Gemini => {
                        Arc::new(GeminiEmbeddingProvider::from_settings(&settings.gemini))
                    },
                    ProviderKind::Local => {
                        Arc::new(LocalEmbeddingProvider::from_settings(&settings.local))
                    },
                }
            })
            .collect();
        let requested = match settings.requested {
            ProviderChoice::OpenAi => "openai",
            ProviderChoice::Gemini => "gemini",
            ProviderChoice::Local => "local",
            ProviderChoice::Auto => "auto",
        };
        Self::new(requested, candidates, probe_timeout)
    }

    /// Resolve the active provider, probing only on first use.
    pub async fn resolve(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        let mut sel = self.selection.lock().await;
        if let Some(idx) = sel.active {
            return Ok(Arc::clone(&self.candidates[idx]));
        }
        if let ProviderState::Exhausted { reason } = &sel.state {
            return Err(MemoryError::ProviderUnavailable(reason.clone()));
        }

        let mut first_failure: Option<(ProviderKind, String)> = None;
        let mut failures = Vec::new();
        while sel.cursor < self.candidates.len() {
            let candidate = &self.candidates[sel.cursor];
            match self.probe(candidate.as_ref()).await {
                Ok(()) => {
                    sel.active = Some(sel.cursor);
                    sel.state = match first_failure {
                        None if sel.cursor == 0 => ProviderState::Primary,
                        None => sel.state.clone(),
                        Some((from, reason)) => {
                            warn!(%from, to = %candidate.kind(), %reason, "embedding provider fallback");
                            ProviderState::Fallback { from, reason }
                        },
                    };
                    info!(
                        provider = %candidate.kind(),
                        model = candidate.model_name(),
                        "embedding provider resolved"
                    );
                    return Ok(Arc::clone(candidate));
                },
                Err(err) => {
                    let reason = err.to_string();
                    warn!(provider = %candidate.kind(), %reason, "embedding provider probe failed");
                    failures.push(format!("{}: {reason}", candidate.kind()));
                    first_failure.get_or_insert((candidate.kind(), reason));
                    sel.cursor += 1;
                },
            }
        }

        let reason = if self.candidates.is_empty() {
            "no embedding providers configured".to_string()
        } else if failures.is_empty() {
            "every embedding provider has been demoted".to_string()
        } else {
            failures.join("; ")
        };
        sel.state = ProviderState::Exhausted {
            reason: reason.clone(),
        };
        Err(MemoryError::ProviderUnavailable(reason))
    }

    /// The active provider, if one has been resolved and not exhausted.
    pub async fn current(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        let sel = self.selection.lock().await;
        sel.active.map(|idx| Arc::clone(&self.candidates[idx]))
    }

    /// Demote `failed` after a permanent runtime failure and move to the next
    /// candidate. A caller racing an earlier demotion gets the provider that
    /// replaced it. Returns `None` once every candidate is gone.
    pub async fn fall_back(
        &self,
        failed: ProviderKind,
        err: &EmbeddingError,
    ) -> Option<Arc<dyn EmbeddingProvider>> {
        {
            let mut sel = self.selection.lock().await;
            let idx = sel.active?;
            if self.candidates[idx].kind() != failed {
                return Some(Arc::clone(&self.candidates[idx]));
            }
            sel.active = None;
            sel.cursor = idx + 1;
            // Keep the first failing provider as the reported origin.
            if !matches!(sel.state, ProviderState::Fallback { .. }) {
                sel.state = ProviderState::Fallback {
                    from: failed,
                    reason: err.to_string(),
                };
            }
        }
        warn!(from = %failed, error = %err, "embedding provider demoted at runtime");
        self.resolve().await.ok()
    }

    /// Forget the selection; the next `resolve` re-probes from the top.
    pub async fn reset(&self) {
        let mut sel = self.selection.lock().await;
        sel.cursor = 0;
        sel.active = None;
        sel.state = ProviderState::Unresolved;
    }

    pub async fn status(&self) -> ProviderStatus {
        let sel = self.selection.lock().await;
        let active = sel.active.map(|idx| &self.candidates[idx]);
        ProviderStatus {
            requested: self.requested.clone(),
            active: active.map(|p| p.kind()),
            model: active.map(|p| p.model_name().to_string()),
            state: sel.state.clone(),
        }
    }

    async fn probe(&self, provider: &dyn EmbeddingProvider) -> Result<(), EmbeddingError> {
        match tokio::time::timeout(self.probe_timeout, provider.probe()).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Timeout(self.probe_timeout)),
        }
    }
}
