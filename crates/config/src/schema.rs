/// Config schema types for the memory index (providers, store, chunking, sync).
use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub memory: MemorySearchConfig,
}

/// Which corpus a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// Curated markdown notes (`MEMORY.md`, `memory/**/*.md`, extra paths).
    Memory,
    /// Raw conversation transcripts (`*.jsonl`).
    Sessions,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "memory" => Some(Self::Memory),
            "sessions" => Some(Self::Sessions),
            _ => None,
        }
    }
}

impl fmt::Display for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Embedding backend requested by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Local,
    #[default]
    Auto,
}

/// Provider to fall back to when an explicitly requested one is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackChoice {
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Local,
    #[default]
    None,
}

/// `memory` section: everything the memory index manager needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySearchConfig {
    pub enabled: Option<bool>,
    pub provider: ProviderChoice,
    pub fallback: FallbackChoice,
    /// Model override applied to whichever provider is selected.
    pub model: Option<String>,
    pub sources: Option<Vec<MemorySource>>,
    /// Additional markdown files or directories to index as `memory`.
    pub extra_paths: Vec<PathBuf>,
    /// Directory holding session transcripts. Defaults to `<data_dir>/agents/<agent>/sessions`.
    pub sessions_dir: Option<PathBuf>,
    pub openai: RemoteProviderConfig,
    pub gemini: RemoteProviderConfig,
    pub local: LocalProviderConfig,
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub query: QueryConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub sync: SyncConfig,
}

/// Remote embedding API settings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteProviderConfig {
    /// API key. The provider's standard env var is used when unset.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub dims: Option<usize>,
}

impl fmt::Debug for RemoteProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dims", &self.dims)
            .finish()
    }
}

/// Local model server settings (Ollama-compatible `/api/embed`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalProviderConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub dims: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file. Defaults to `<data_dir>/memory/<agent>.sqlite`.
    pub path: Option<PathBuf>,
    pub vector: SubIndexConfig,
    pub fts: SubIndexConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubIndexConfig {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub tokens: Option<usize>,
    pub overlap: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_results: Option<usize>,
    pub min_score: Option<f32>,
    pub hybrid: HybridConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub vector_weight: Option<f32>,
    pub text_weight: Option<f32>,
    pub candidate_multiplier: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: Option<bool>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: Option<bool>,
    /// Block the sync pass until every embedding batch resolves.
    pub wait: Option<bool>,
    pub concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    /// Per-batch timeout override (applies to remote and local providers alike).
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub failure_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub watch: Option<bool>,
    pub watch_debounce_ms: Option<u64>,
    pub session_debounce_ms: Option<u64>,
    pub interval_minutes: Option<u64>,
    pub on_search: Option<bool>,
    pub sessions: SessionSyncConfig,
}

/// Growth thresholds a session must cross before the watcher marks it dirty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSyncConfig {
    pub delta_bytes: Option<u64>,
    pub delta_messages: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let cfg: RecallConfig = toml::from_str(
            r#"
            [memory]
            provider = "gemini"
            fallback = "local"
            sources = ["memory", "sessions"]

            [memory.chunking]
            tokens = 256

            [memory.store.vector]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.memory.provider, ProviderChoice::Gemini);
        assert_eq!(cfg.memory.fallback, FallbackChoice::Local);
        assert_eq!(
            cfg.memory.sources,
            Some(vec![MemorySource::Memory, MemorySource::Sessions])
        );
        assert_eq!(cfg.memory.chunking.tokens, Some(256));
        assert_eq!(cfg.memory.chunking.overlap, None);
        assert_eq!(cfg.memory.store.vector.enabled, Some(false));
        assert_eq!(cfg.memory.store.fts.enabled, None);
    }

    #[test]
    fn openai_spelling() {
        let cfg: MemorySearchConfig = serde_json::from_str(r#"{"provider":"openai"}"#).unwrap();
        assert_eq!(cfg.provider, ProviderChoice::OpenAi);
    }

    #[test]
    fn debug_redacts_api_key() {
        let remote = RemoteProviderConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let dbg = format!("{remote:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn source_names() {
        assert_eq!(MemorySource::parse("sessions"), Some(MemorySource::Sessions));
        assert_eq!(MemorySource::parse("notes"), None);
        assert_eq!(MemorySource::Memory.to_string(), "memory");
    }
}
