/// Gemini embeddings provider using the `batchEmbedContents` endpoint.
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

const PROVIDER: &str = "gemini";
const DEFAULT_DIMS: usize = 3072;

pub struct GeminiEmbeddingProvider {
    client: reqwest::Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    requested_dims: Option<usize>,
    provider_key: String,
}

fn compute_provider_key(base_url: &str, model: &str, dims: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("gemini:{base_url}:{model}:{dims}").as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Models are addressed as `models/<name>`; accept either spelling in config.
fn model_path(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        let base_url = crate::config::DEFAULT_GEMINI_BASE_URL.to_string();
        let model = crate::config::DEFAULT_GEMINI_MODEL.to_string();
        let provider_key = compute_provider_key(&base_url, &model, DEFAULT_DIMS);
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_key: Secret::new(api_key),
            base_url,
            model,
            dims: DEFAULT_DIMS,
            requested_dims: None,
            provider_key,
        }
    }

    /// Build from resolved settings, reading `GEMINI_API_KEY` (or `GOOGLE_API_KEY`)
    /// when no key is configured.
    pub fn from_settings(settings: &RemoteSettings) -> Self {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .unwrap_or_default();
        let mut provider = Self::new(api_key)
            .with_base_url(settings.base_url.clone())
            .with_model(settings.model.clone(), settings.dims.unwrap_or(DEFAULT_DIMS));
        provider.requested_dims = settings.dims;
        provider
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
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
#[serde(rename_all = "camelCase")]
struct BatchRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: &'a str,
    content: Content<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = model_path(&self.model);
        let body = BatchRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: &model,
                    content: Content {
                        parts: [Part { text }],
                    },
                    output_dimensionality: self.requested_dims,
                })
                .collect(),
        };

        let resp = self
            .client
            .post(format!("{}/v1beta/{model}:batchEmbedContents", self.base_url))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::from_status(PROVIDER, status, body));
        }

        let parsed = resp
            .json::<BatchResponse>()
            .await
            .map_err(|e| EmbeddingError::from_transport(PROVIDER, &e))?;
        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Unknown(format!(
                "gemini returned {} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }
        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }

    async fn probe(&self) -> Result<(), EmbeddingError> {
        if self.api_key.expose_secret().trim().is_empty() {
            return Err(EmbeddingError::Unavailable {
                provider: PROVIDER.into(),
                message: "no API key configured (set memory.gemini.api_key or GEMINI_API_KEY)"
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
