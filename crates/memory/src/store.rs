/// Storage abstraction for tracked files, chunks, both sub-indices and the embedding cache.
use std::{collections::HashMap, time::Duration};

use {
    async_trait::async_trait,
    recall_config::MemorySource,
    serde::{Deserialize, Serialize},
};

use crate::{
    embeddings::Fingerprint,
    error::Result,
    schema::{FileRow, SessionFileRow},
};

/// Availability of one sub-index. `Unknown` until the first probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum IndexAvailability {
    Unknown,
    Ready,
    Failed(String),
    Disabled,
}

impl IndexAvailability {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn load_error(&self) -> Option<&str> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// The singleton describing which embedding space and chunking produced the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    pub vector_dims: usize,
}

impl IndexMeta {
    /// Human-readable list of fields that differ, empty when equal.
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let mut out = Vec::new();
        if self.provider != other.provider {
            out.push(format!("provider {} -> {}", self.provider, other.provider));
        }
        if self.model != other.model {
            out.push(format!("model {} -> {}", self.model, other.model));
        }
        if self.provider_key != other.provider_key {
            out.push("provider key".to_string());
        }
        if self.chunk_tokens != other.chunk_tokens || self.chunk_overlap != other.chunk_overlap {
            out.push(format!(
                "chunking {}/{} -> {}/{}",
                self.chunk_tokens, self.chunk_overlap, other.chunk_tokens, other.chunk_overlap
            ));
        }
        if self.vector_dims != other.vector_dims {
            out.push(format!("dims {} -> {}", self.vector_dims, other.vector_dims));
        }
        out
    }
}

/// A chunk about to be written, optionally with its vector.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: String,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// A vector computed for a chunk that may have been replaced since.
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub id: String,
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// A stored chunk that has no vector in the current embedding space.
#[derive(Debug, Clone)]
pub struct UnembeddedChunk {
    pub id: String,
    pub path: String,
    pub hash: String,
    pub text: String,
}

/// A raw sub-index match before fusion.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub updated_at: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexCounts {
    pub files: usize,
    pub session_files: usize,
    /// Chunk count per source name.
    pub chunks: HashMap<String, usize>,
    pub vectors: usize,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    // ---- metadata ----
    async fn read_meta(&self) -> Result<Option<IndexMeta>>;
    async fn write_meta(&self, meta: &IndexMeta) -> Result<()>;
    /// Drop every chunk, vector and tracked file. The embedding cache survives.
    async fn reset_index(&self) -> Result<()>;

    // ---- sub-index availability ----
    async fn probe_vector(&self, timeout: Duration) -> IndexAvailability;
    async fn probe_fts(&self, timeout: Duration) -> IndexAvailability;
    fn vector_availability(&self) -> IndexAvailability;
    fn fts_availability(&self) -> IndexAvailability;

    // ---- memory files ----
    async fn get_file(&self, path: &str) -> Result<Option<FileRow>>;
    async fn list_files(&self) -> Result<Vec<FileRow>>;
    /// Update the file record alone (mtime/size refresh after a no-op save).
    async fn touch_file(&self, file: &FileRow) -> Result<()>;
    /// Atomically swap every chunk of `file.path` for `chunks`.
    async fn replace_file(&self, file: &FileRow, model: &str, chunks: &[NewChunk]) -> Result<()>;
    /// Remove a path and everything indexed from it, memory or session.
    async fn remove_path(&self, path: &str) -> Result<()>;

    // ---- session transcripts ----
    async fn get_session(&self, path: &str) -> Result<Option<SessionFileRow>>;
    async fn list_sessions(&self) -> Result<Vec<SessionFileRow>>;
    /// Append chunks read from a session and advance its cursor in one
    /// transaction. With `replace`, the path's previous chunks are dropped first.
    async fn append_session(
        &self,
        cursor: &SessionFileRow,
        model: &str,
        chunks: &[NewChunk],
        replace: bool,
    ) -> Result<()>;

    // ---- vectors ----
    /// Store vectors for chunks whose id and hash still match. Returns the number written.
    async fn attach_embeddings(&self, items: &[ChunkEmbedding]) -> Result<usize>;
    /// Chunks without a vector of `dims` dimensions.
    async fn chunks_missing_vectors(&self, dims: usize) -> Result<Vec<UnembeddedChunk>>;

    // ---- embedding cache ----
    async fn cache_get(
        &self,
        fingerprint: &Fingerprint,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>>;
    async fn cache_put(&self, fingerprint: &Fingerprint, entries: &[(String, Vec<f32>)])
    -> Result<()>;
    async fn cache_count(&self) -> Result<usize>;
    /// Evict least-recently-used rows until at most `keep` remain.
    async fn cache_prune(&self, keep: usize) -> Result<usize>;

    // ---- search ----
    async fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<MemorySource>,
    ) -> Result<Vec<SearchHit>>;
    async fn keyword_search(
        &self,
        fts_query: &str,
        limit: usize,
        source: Option<MemorySource>,
    ) -> Result<Vec<SearchHit>>;

    async fn counts(&self) -> Result<IndexCounts>;
    async fn close(&self);
}
