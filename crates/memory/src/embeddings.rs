/// Provider-agnostic embedding trait for generating vectors from text.
use std::fmt;

use {async_trait::async_trait, serde::Serialize};

use crate::error::EmbeddingError;

/// Concrete embedding backends, in auto-mode preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Local,
}

impl ProviderKind {
    pub const AUTO_ORDER: [ProviderKind; 3] = [Self::OpenAi, Self::Gemini, Self::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Local => "local",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Generate embeddings for a batch of texts, one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Generate an embedding for a search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::Unknown("empty embedding response".into()))
    }

    /// Cheap availability check (credentials present, server reachable).
    async fn probe(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }

    /// The model name used by this provider (e.g. "text-embedding-3-small").
    fn model_name(&self) -> &str;

    /// The dimensionality of the embeddings produced.
    fn dimensions(&self) -> usize;

    /// A stable key identifying this provider configuration for cache discrimination.
    fn provider_key(&self) -> &str;
}

/// Which embedding space a vector belongs to: (provider, model, key, dims).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
    pub dims: usize,
}

impl Fingerprint {
    pub fn of(provider: &dyn EmbeddingProvider) -> Self {
        Self {
            provider: provider.kind().as_str().to_string(),
            model: provider.model_name().to_string(),
            provider_key: provider.provider_key().to_string(),
            dims: provider.dimensions(),
        }
    }
}

/// Encode a vector as a little-endian f32 blob.
pub fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 blob; trailing partial floats are ignored.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
