use std::{fmt, path::PathBuf, time::Duration};

use {
    recall_config::schema::{FallbackChoice, MemorySearchConfig, MemorySource, ProviderChoice},
    serde::Serialize,
};

use crate::{
    chunker::hash_text,
    error::{MemoryError, Result},
};

pub const DEFAULT_CHUNK_TOKENS: usize = 400;
pub const DEFAULT_CHUNK_OVERLAP: usize = 80;
pub const DEFAULT_MAX_RESULTS: usize = 6;
pub const DEFAULT_MIN_SCORE: f32 = 0.35;
pub const SNIPPET_MAX_CHARS: usize = 700;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 50_000;
pub const SESSION_DIRTY_DEBOUNCE_MS: u64 = 5_000;
pub const SESSION_DELTA_READ_CHUNK_BYTES: usize = 64 * 1024;
pub const WATCH_DEBOUNCE_MS: u64 = 1_500;
pub const EMBEDDING_BATCH_MAX_TOKENS: usize = 8_000;
/// Conservative ratio for batch budgeting; chunking itself uses `chunker::CHARS_PER_TOKEN`.
pub const EMBEDDING_APPROX_CHARS_PER_TOKEN: usize = 1;
pub const EMBEDDING_INDEX_CONCURRENCY: usize = 4;
pub const EMBEDDING_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const EMBEDDING_RETRY_BASE_DELAY_MS: u64 = 500;
pub const EMBEDDING_RETRY_MAX_DELAY_MS: u64 = 8_000;
pub const BATCH_FAILURE_LIMIT: usize = 2;
pub const BATCH_POLL_INTERVAL_MS: u64 = 2_000;
pub const VECTOR_LOAD_TIMEOUT_MS: u64 = 30_000;
pub const EMBEDDING_QUERY_TIMEOUT_REMOTE_MS: u64 = 60_000;
pub const EMBEDDING_QUERY_TIMEOUT_LOCAL_MS: u64 = 5 * 60_000;
pub const EMBEDDING_BATCH_TIMEOUT_REMOTE_MS: u64 = 2 * 60_000;
pub const EMBEDDING_BATCH_TIMEOUT_LOCAL_MS: u64 = 10 * 60_000;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_LOCAL_MODEL: &str = "nomic-embed-text";

/// Fully resolved configuration of one memory index manager.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    /// Path to the SQLite database file (or `:memory:` for tests).
    pub db_path: String,
    pub sources: Vec<MemorySource>,
    pub extra_paths: Vec<PathBuf>,
    pub sessions_dir: PathBuf,
    pub provider: ProviderSettings,
    /// Target chunk size in tokens.
    pub chunk_tokens: usize,
    /// Overlap between consecutive chunks in tokens.
    pub chunk_overlap: usize,
    pub query: QuerySettings,
    pub cache: CacheSettings,
    pub vector_enabled: bool,
    pub fts_enabled: bool,
    /// Bound on vector/FTS availability probes.
    pub probe_timeout: Duration,
    pub batch: BatchSettings,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSettings {
    pub requested: ProviderChoice,
    pub fallback: FallbackChoice,
    pub openai: RemoteSettings,
    pub gemini: RemoteSettings,
    pub local: LocalSettings,
}

#[derive(Clone, Serialize)]
pub struct RemoteSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub dims: Option<usize>,
}

impl fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dims", &self.dims)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalSettings {
    pub base_url: String,
    pub model: String,
    pub dims: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuerySettings {
    pub max_results: usize,
    pub min_score: f32,
    /// Weight for vector similarity in hybrid search.
    pub vector_weight: f32,
    /// Weight for keyword/FTS relevance in hybrid search.
    pub text_weight: f32,
    /// Each sub-index is asked for `limit * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    pub snippet_max_chars: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSettings {
    pub enabled: bool,
    /// Block the sync pass until every dispatched batch resolves.
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_tokens: usize,
    pub remote_timeout: Duration,
    pub local_timeout: Duration,
    pub query_timeout_remote: Duration,
    pub query_timeout_local: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Consecutive fully-failed batches before the circuit breaker opens.
    pub failure_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSettings {
    pub watch: bool,
    pub watch_debounce: Duration,
    pub session_debounce: Duration,
    pub interval: Option<Duration>,
    pub on_search: bool,
    pub session_delta_bytes: u64,
    pub session_delta_messages: u64,
}

impl MemoryConfig {
    /// Defaults for an agent workspace, no config file involved.
    pub fn for_workspace(agent_id: &str, workspace_dir: impl Into<PathBuf>) -> Self {
        Self::build(&MemorySearchConfig::default(), agent_id, workspace_dir.into())
    }

    /// Fill every unset option of the memory-search section and validate the result.
    pub fn resolve(
        section: &MemorySearchConfig,
        agent_id: &str,
        workspace_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let config = Self::build(section, agent_id, workspace_dir.into());
        config.validate()?;
        Ok(config)
    }

    fn build(section: &MemorySearchConfig, agent_id: &str, workspace_dir: PathBuf) -> Self {
        let data_dir = recall_config::data_dir();
        let db_path = section
            .store
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("memory").join(format!("{agent_id}.sqlite")));
        let sessions_dir = section.sessions_dir.clone().unwrap_or_else(|| {
            data_dir.join("agents").join(agent_id).join("sessions")
        });
        let model = section.model.clone();
        let batch = &section.batch;
        let hybrid = &section.query.hybrid;

        let mut sources = section
            .sources
            .clone()
            .unwrap_or_else(|| vec![MemorySource::Memory]);
        sources.sort();
        sources.dedup();

        Self {
            agent_id: agent_id.to_string(),
            workspace_dir,
            db_path: db_path.to_string_lossy().into_owned(),
            sources,
            extra_paths: section.extra_paths.clone(),
            sessions_dir,
            provider: ProviderSettings {
                requested: section.provider,
                fallback: section.fallback,
                openai: RemoteSettings {
                    api_key: section.openai.api_key.clone(),
                    base_url: section
                        .openai
                        .base_url
                        .clone()
                        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.into()),
                    model: section
                        .openai
                        .model
                        .clone()
                        .or_else(|| model.clone())
                        .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.into()),
                    dims: section.openai.dims,
                },
                gemini: RemoteSettings {
                    api_key: section.gemini.api_key.clone(),
                    base_url: section
                        .gemini
                        .base_url
                        .clone()
                        .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.into()),
                    model: section
                        .gemini
                        .model
                        .clone()
                        .or_else(|| model.clone())
                        .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.into()),
                    dims: section.gemini.dims,
                },
                local: LocalSettings {
                    base_url: section
                        .local
                        .base_url
                        .clone()
                        .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.into()),
                    model: section
                        .local
                        .model
                        .clone()
                        .or(model)
                        .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.into()),
                    dims: section.local.dims,
                },
            },
            chunk_tokens: section.chunking.tokens.unwrap_or(DEFAULT_CHUNK_TOKENS),
            chunk_overlap: section.chunking.overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
            query: QuerySettings {
                max_results: section.query.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
                min_score: section.query.min_score.unwrap_or(DEFAULT_MIN_SCORE),
                vector_weight: hybrid.vector_weight.unwrap_or(0.7),
                text_weight: hybrid.text_weight.unwrap_or(0.3),
                candidate_multiplier: hybrid.candidate_multiplier.unwrap_or(4),
                snippet_max_chars: SNIPPET_MAX_CHARS,
            },
            cache: CacheSettings {
                enabled: section.cache.enabled.unwrap_or(true),
                max_entries: section
                    .cache
                    .max_entries
                    .unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            },
            vector_enabled: section.store.vector.enabled.unwrap_or(true),
            fts_enabled: section.store.fts.enabled.unwrap_or(true),
            probe_timeout: Duration::from_millis(VECTOR_LOAD_TIMEOUT_MS),
            batch: BatchSettings {
                enabled: batch.enabled.unwrap_or(true),
                wait: batch.wait.unwrap_or(true),
                concurrency: batch.concurrency.unwrap_or(EMBEDDING_INDEX_CONCURRENCY),
                poll_interval: Duration::from_millis(
                    batch.poll_interval_ms.unwrap_or(BATCH_POLL_INTERVAL_MS),
                ),
                max_tokens: EMBEDDING_BATCH_MAX_TOKENS,
                remote_timeout: Duration::from_millis(
                    batch.timeout_ms.unwrap_or(EMBEDDING_BATCH_TIMEOUT_REMOTE_MS),
                ),
                local_timeout: Duration::from_millis(
                    batch.timeout_ms.unwrap_or(EMBEDDING_BATCH_TIMEOUT_LOCAL_MS),
                ),
                query_timeout_remote: Duration::from_millis(EMBEDDING_QUERY_TIMEOUT_REMOTE_MS),
                query_timeout_local: Duration::from_millis(EMBEDDING_QUERY_TIMEOUT_LOCAL_MS),
                max_attempts: batch.max_attempts.unwrap_or(EMBEDDING_RETRY_MAX_ATTEMPTS),
                retry_base_delay: Duration::from_millis(
                    batch
                        .retry_base_delay_ms
                        .unwrap_or(EMBEDDING_RETRY_BASE_DELAY_MS),
                ),
                retry_max_delay: Duration::from_millis(
                    batch
                        .retry_max_delay_ms
                        .unwrap_or(EMBEDDING_RETRY_MAX_DELAY_MS),
                ),
                failure_limit: batch.failure_limit.unwrap_or(BATCH_FAILURE_LIMIT),
            },
            sync: SyncSettings {
                watch: section.sync.watch.unwrap_or(true),
                watch_debounce: Duration::from_millis(
                    section.sync.watch_debounce_ms.unwrap_or(WATCH_DEBOUNCE_MS),
                ),
                session_debounce: Duration::from_millis(
                    section
                        .sync
                        .session_debounce_ms
                        .unwrap_or(SESSION_DIRTY_DEBOUNCE_MS),
                ),
                interval: section
                    .sync
                    .interval_minutes
                    .filter(|m| *m > 0)
                    .map(|m| Duration::from_secs(m * 60)),
                on_search: section.sync.on_search.unwrap_or(true),
                session_delta_bytes: section.sync.sessions.delta_bytes.unwrap_or(0),
                session_delta_messages: section.sync.sessions.delta_messages.unwrap_or(0),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_tokens == 0 {
            return Err(MemoryError::Config("chunking.tokens must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_tokens {
            return Err(MemoryError::Config(format!(
                "chunking.overlap ({}) must be smaller than chunking.tokens ({})",
                self.chunk_overlap, self.chunk_tokens
            )));
        }
        if self.batch.concurrency == 0 {
            return Err(MemoryError::Config("batch.concurrency must be at least 1".into()));
        }
        if self.batch.max_attempts == 0 {
            return Err(MemoryError::Config("batch.max_attempts must be at least 1".into()));
        }
        let (v, t) = (self.query.vector_weight, self.query.text_weight);
        if v < 0.0 || t < 0.0 || v + t <= 0.0 {
            return Err(MemoryError::Config(format!(
                "hybrid weights must be non-negative and not both zero (vector={v}, text={t})"
            )));
        }
        if self.sources.is_empty() {
            return Err(MemoryError::Config("at least one source must be enabled".into()));
        }
        Ok(())
    }

    pub fn source_enabled(&self, source: MemorySource) -> bool {
        self.sources.contains(&source)
    }

    /// Roots scanned for memory markdown: `MEMORY.md`, `memory.md`, `memory/` and extra paths.
    pub fn memory_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![
            self.workspace_dir.join("MEMORY.md"),
            self.workspace_dir.join("memory.md"),
            self.workspace_dir.join("memory"),
        ];
        for extra in &self.extra_paths {
            if extra.is_absolute() {
                roots.push(extra.clone());
            } else {
                roots.push(self.workspace_dir.join(extra));
            }
        }
        roots
    }

    /// Registry key: agent, workspace and a digest of every resolved setting.
    pub fn cache_key(&self) -> String {
        let digest = serde_json::to_string(self)
            .map(|json| hash_text(&json))
            .unwrap_or_default();
        format!(
            "{}:{}:{}",
            self.agent_id,
            self.workspace_dir.display(),
            &digest[..digest.len().min(16)]
        )
    }
}
