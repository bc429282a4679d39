//! Error taxonomy for the memory index.
//!
//! Provider failures are recovered inside a sync pass (retry, fallback, circuit
//! breaker) and only surface through [`MemoryError::ProviderUnavailable`] when no
//! backend can be resolved at all. Storage failures always propagate.

use std::{sync::Arc, time::Duration};

/// Failure of the consumed `embed(texts)` capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("rate limited by {provider}: {message}")]
    RateLimited { provider: String, message: String },

    #[error("{provider} unavailable: {message}")]
    Unavailable {
        provider: String,
        message: String,
        /// Network blips and 5xx responses are transient; missing credentials are not.
        transient: bool,
    },

    #[error("{provider} rejected input: {message}")]
    InvalidInput { provider: String, message: String },

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding failed: {0}")]
    Unknown(String),
}

impl EmbeddingError {
    /// Only rate limits, transient outages and timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            Self::Unavailable { transient, .. } => *transient,
            Self::InvalidInput { .. } | Self::Unknown(_) => false,
        }
    }

    /// A permanent outage: the provider should be replaced rather than retried.
    pub fn is_permanent_outage(&self) -> bool {
        matches!(
            self,
            Self::Unavailable {
                transient: false,
                ..
            }
        )
    }

    /// Classify an HTTP status returned by an embedding endpoint.
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: String) -> Self {
        let provider = provider.to_string();
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(&body, 300));
        match status.as_u16() {
            429 => Self::RateLimited { provider, message },
            401 | 403 => Self::Unavailable {
                provider,
                message,
                transient: false,
            },
            400 | 404 | 413 | 422 => Self::InvalidInput { provider, message },
            500..=599 | 408 => Self::Unavailable {
                provider,
                message,
                transient: true,
            },
            _ => Self::Unknown(message),
        }
    }

    /// Classify a transport-level `reqwest` error.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        let provider = provider.to_string();
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Unavailable {
                provider,
                message: err.to_string(),
                transient: true,
            }
        } else if err.is_decode() {
            Self::Unknown(format!("{provider}: malformed response: {err}"))
        } else {
            Self::Unknown(format!("{provider}: {err}"))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Errors surfaced to callers of the memory index manager.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    /// No embedding backend could be resolved.
    #[error("no embedding provider available: {0}")]
    ProviderUnavailable(String),

    #[error("embedding provider failed transiently: {0}")]
    ProviderTransient(#[source] EmbeddingError),

    /// Neither the vector nor the lexical sub-index can serve queries.
    #[error("memory index unavailable: {0}")]
    IndexUnavailable(String),

    /// Stored index metadata disagrees with the active configuration.
    #[error("index metadata mismatch: {0}")]
    ConfigMismatch(String),

    #[error("storage error: {0}")]
    Storage(#[source] Arc<sqlx::Error>),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("memory index manager is closed")]
    Closed,
}

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(Arc::new(err))
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(Arc::new(sqlx::Error::Decode(Box::new(err))))
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
