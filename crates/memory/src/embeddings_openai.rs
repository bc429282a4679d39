/// OpenAI embeddings provider using the `/v1/embeddings` endpoint.
use std::time::Duration;

use async_trait::async_trait;
use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

use crate::{
    config::RemoteSettings,
    embeddings::{EmbeddingProvider, ProviderKind},
    error::EmbeddingError,
};

const PROVIDER: &str = "openai";

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    /// Only sent when explicitly configured; v3 models accept a reduced size.
    requested_dims: Option<usize>,
    provider_key: String,
}

fn compute_provider_key(base_url: &str, model: &str, dims: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"openai:");
    hasher.update(base_url.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    hasher.update(b":");
    hasher.update(dims.to_string().as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn default_dims(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        let base_url = crate::config::DEFAULT_OPENAI_BASE_URL.to_string();
        let model = crate::config::DEFAULT_OPENAI_MODEL.to_string();
        let dims = default_dims(&model);
        let provider_key = compute_provider_key(&base_url, &model, dims);
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_key: Secret::new(api_key),
            base_url,
            model,
            dims,
            requested_dims: None,
            provider_key,
        }
    }

    /// Build from resolved settings, reading `OPENAI_API_KEY` when no key is configured.
    pub fn from_settings(settings: &RemoteSettings) -> Self {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        let dims = settings.dims.unwrap_or_else(|| default_dims(&settings.model));
        let mut provider = Self::new(api_key)
            .with_base_url(settings.base_url.clone())
            .with_model(settings.model.clone(), dims);
        provider.requested_dims = settings.dims;
        provider
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self.requested_dims = Some(dims);
        self.provider_key = compute_provider_key(&self.base_url, &self.model, self.dims);
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.provider_key = compute_provider_key(&self.base_url, &self.model, self.dims);
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.requested_dims,
        };

        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&req)
            .send()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::from_status(PROVIDER, status, body));
        }

        let mut parsed = resp
            .json::<EmbeddingResponse>()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::Unknown(format!(
                "openai returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn probe(&self) -> Result<(), EmbeddingError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(EmbeddingError::Unavailable {
                provider: PROVIDER.into(),
                message: "no API key configured (set memory.openai.api_key or OPENAI_API_KEY)"
                    .into(),
                transient: false,
            });
        }
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
