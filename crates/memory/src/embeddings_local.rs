/// Local embeddings via a model server speaking the Ollama `/api/embed` protocol.
use std::time::Duration;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::debug,
};

use crate::{
    config::LocalSettings,
    embeddings::{EmbeddingProvider, ProviderKind},
    error::EmbeddingError,
};

const PROVIDER: &str = "local";

fn default_dims(model: &str) -> usize {
    match model.split(':').next().unwrap_or(model) {
        "mxbai-embed-large" => 1024,
        "all-minilm" => 384,
        _ => 768,
    }
}

pub struct LocalEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

impl LocalEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let dims = default_dims(&model);
        let mut provider = Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model,
            dims,
            provider_key: String::new(),
        };
        provider.refresh_key();
        provider
    }

    pub fn from_settings(settings: &LocalSettings) -> Self {
        let mut provider = Self::new(settings.base_url.clone(), settings.model.clone());
        if let Some(dims) = settings.dims {
            provider.dims = dims;
            provider.refresh_key();
        }
        provider
    }

    fn refresh_key(&mut self) {
        let mut hasher = Sha256::new();
        hasher.update(format!("local:{}:{}:{}", self.base_url, self.model, self.dims).as_bytes());
        self.provider_key = format!("{:x}", hasher.finalize())[..16].to_string();
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::from_status(PROVIDER, status, body));
        }
        let parsed = resp
            .json::<EmbedResponse>()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Unknown(format!(
                "local model returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings)
    }

    /// Reachability check: the model server must answer `/api/tags`.
    async fn probe(&self) -> Result<(), EmbeddingError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::from_status(PROVIDER, status, body));
        }
        debug!(base_url = %self.base_url, model = %self.model, "local embedding server reachable");
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embeds_via_api_embed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/embed")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"model":"nomic-embed-text","input":["one"]}"#.into(),
            ))
            .with_status(200)
            .with_body(r#"{"model":"nomic-embed-text","embeddings":[[0.5,0.5]]}"#)
            .create_async()
            .await;

        let provider = LocalEmbeddingProvider::new(server.url(), "nomic-embed-text");
        let out = provider.embed_batch(&["one".into()]).await.unwrap();
        assert_eq!(out, vec![vec![0.5, 0.5]]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn probe_hits_tags_endpoint() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models":[]}"#)
            .create_async()
            .await;
        let provider = LocalEmbeddingProvider::new(server.url(), "nomic-embed-text");
        provider.probe().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        // Port 9 (discard) is not expected to run an HTTP server.
        let provider = LocalEmbeddingProvider::new("http://127.0.0.1:9", "nomic-embed-text");
        let err = provider.probe().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn dims_follow_model_family() {
        assert_eq!(LocalEmbeddingProvider::new("http://x", "all-minilm:l6-v2").dimensions(), 384);
        assert_eq!(LocalEmbeddingProvider::new("http://x", "nomic-embed-text").dimensions(), 768);
    }
}
