//! Memory index: markdown notes and session transcripts → chunked → embedded →
//! hybrid vector/keyword search in SQLite.

pub mod batch;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod embeddings_gemini;
pub mod embeddings_local;
pub mod embeddings_openai;
pub mod error;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
pub mod sync;
#[cfg(feature = "file-watcher")]
pub mod watcher;

pub use {
    config::MemoryConfig,
    embeddings::{EmbeddingProvider, ProviderKind},
    error::{EmbeddingError, MemoryError, Result},
    manager::{MemoryIndexManager, MemoryStatus},
    recall_config::MemorySource,
    registry::ManagerRegistry,
    search::{MemorySearchResult, SearchMode},
    sync::SyncReport,
};
