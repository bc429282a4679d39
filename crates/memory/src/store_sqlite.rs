/// SQLite implementation of [`MemoryStore`]: chunk table, exact-scan vector
/// sub-index, FTS5 lexical sub-index and the embedding cache.
use std::{
    collections::HashMap,
    path::Path,
    str::FromStr,
    sync::{
        Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    recall_config::MemorySource,
    sqlx::{
        QueryBuilder, Sqlite, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    },
    tracing::{debug, info, warn},
};

use crate::{
    embeddings::{Fingerprint, blob_to_vector, vector_to_blob},
    error::Result,
    schema::{FileRow, META_KEY, SessionFileRow},
    search::{bm25_relevance, cosine_similarity},
    store::{
        ChunkEmbedding, IndexAvailability, IndexCounts, IndexMeta, MemoryStore, NewChunk,
        SearchHit, UnembeddedChunk,
    },
};

/// SQLite caps bound parameters per statement; stay well below it.
const IN_CLAUSE_BATCH: usize = 400;

/// Open (creating if needed) the index database. `:memory:` yields a
/// single-connection in-memory pool.
pub async fn open_pool(db_path: &str) -> Result<SqlitePool> {
    if db_path == ":memory:" || db_path.starts_with("sqlite::memory:") {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        return Ok(pool);
    }

    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub struct SqliteMemoryStore {
    pool: SqlitePool,
    vector_enabled: bool,
    fts_enabled: bool,
    vector: Mutex<IndexAvailability>,
    fts: Mutex<IndexAvailability>,
    /// Strictly increasing millisecond stamps so LRU order survives same-ms writes.
    last_stamp: AtomicI64,
}

#[derive(sqlx::FromRow)]
struct VectorRow {
    id: String,
    path: String,
    source: String,
    start_line: i64,
    end_line: i64,
    text: String,
    updated_at: i64,
    embedding: Vec<u8>,
}

#[derive(sqlx::FromRow)]
struct KeywordRow {
    id: String,
    path: String,
    source: String,
    start_line: i64,
    end_line: i64,
    text: String,
    updated_at: i64,
    bm25_rank: f64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl SqliteMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_sub_indices(pool, true, true)
    }

    /// A store whose vector and/or lexical sub-index is switched off by configuration.
    pub fn with_sub_indices(pool: SqlitePool, vector_enabled: bool, fts_enabled: bool) -> Self {
        let initial = |enabled: bool| {
            if enabled {
                IndexAvailability::Unknown
            } else {
                IndexAvailability::Disabled
            }
        };
        Self {
            pool,
            vector_enabled,
            fts_enabled,
            vector: Mutex::new(initial(vector_enabled)),
            fts: Mutex::new(initial(fts_enabled)),
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn stamp(&self) -> i64 {
        let now = now_ms();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn fts_ready(&self) -> bool {
        self.fts_availability().is_ready()
    }

    /// Create the FTS5 table and rebuild it from `chunks`. Rows written or
    /// deleted while the lexical index was off are otherwise out of step.
    async fn create_fts(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(\
             text, id UNINDEXED, path UNINDEXED, source UNINDEXED)",
        )
        .execute(&self.pool)
        .await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
        let rebuilt = sqlx::query(
            "INSERT INTO chunks_fts (text, id, path, source) \
             SELECT text, id, path, source FROM chunks",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        if rebuilt > 0 {
            info!(rows = rebuilt, "lexical index rebuilt from chunks");
        }
        Ok(())
    }

    async fn insert_chunks(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        path: &str,
        source: MemorySource,
        model: &str,
        chunks: &[NewChunk],
    ) -> Result<()> {
        let fts = self.fts_ready();
        for chunk in chunks {
            sqlx::query(
                r#"INSERT OR REPLACE INTO chunks
                   (id, path, source, start_line, end_line, hash, model, text, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&chunk.id)
            .bind(path)
            .bind(source.as_str())
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.hash)
            .bind(model)
            .bind(&chunk.text)
            .bind(self.stamp())
            .execute(&mut **tx)
            .await?;

            if let Some(embedding) = &chunk.embedding {
                sqlx::query("INSERT OR REPLACE INTO chunks_vec (id, embedding, dims) VALUES (?, ?, ?)")
                    .bind(&chunk.id)
                    .bind(vector_to_blob(embedding))
                    .bind(embedding.len() as i64)
                    .execute(&mut **tx)
                    .await?;
            }

            if fts {
                sqlx::query("INSERT INTO chunks_fts (text, id, path, source) VALUES (?, ?, ?, ?)")
                    .bind(&chunk.text)
                    .bind(&chunk.id)
                    .bind(path)
                    .bind(source.as_str())
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_chunks(
        &self,
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        path: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM chunks_vec WHERE id IN (SELECT id FROM chunks WHERE path = ?)")
            .bind(path)
            .execute(&mut **tx)
            .await?;
        if self.fts_ready() {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ?")
                .bind(path)
                .execute(&mut **tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(path)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn lock_state(m: &Mutex<IndexAvailability>) -> std::sync::MutexGuard<'_, IndexAvailability> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn read_meta(&self) -> Result<Option<IndexMeta>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(META_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(META_KEY)
        .bind(serde_json::to_string(meta)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_index(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["chunks_vec", "chunks", "files", "session_files"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        if self.fts_ready() {
            sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM meta WHERE key = ?")
            .bind(META_KEY)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn probe_vector(&self, timeout: Duration) -> IndexAvailability {
        if !self.vector_enabled {
            return IndexAvailability::Disabled;
        }
        {
            let state = lock_state(&self.vector);
            if *state != IndexAvailability::Unknown {
                return state.clone();
            }
        }
        let probe = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM chunks_vec")
            .fetch_one(&self.pool);
        let result = match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(_)) => IndexAvailability::Ready,
            Ok(Err(e)) => IndexAvailability::Failed(e.to_string()),
            Err(_) => IndexAvailability::Failed(format!("vector index load timed out after {timeout:?}")),
        };
        if let Some(err) = result.load_error() {
            warn!(error = err, "vector index unavailable, searches fall back to keywords");
        }
        *lock_state(&self.vector) = result.clone();
        result
    }

    async fn probe_fts(&self, timeout: Duration) -> IndexAvailability {
        if !self.fts_enabled {
            return IndexAvailability::Disabled;
        }
        {
            let state = lock_state(&self.fts);
            if *state != IndexAvailability::Unknown {
                return state.clone();
            }
        }
        let result = match tokio::time::timeout(timeout, self.create_fts()).await {
            Ok(Ok(())) => IndexAvailability::Ready,
            Ok(Err(e)) => IndexAvailability::Failed(e.to_string()),
            Err(_) => IndexAvailability::Failed(format!("fts index load timed out after {timeout:?}")),
        };
        if let Some(err) = result.load_error() {
            warn!(error = err, "full-text index unavailable, keyword search disabled");
        }
        *lock_state(&self.fts) = result.clone();
        result
    }

    fn vector_availability(&self) -> IndexAvailability {
        lock_state(&self.vector).clone()
    }

    fn fts_availability(&self) -> IndexAvailability {
        lock_state(&self.fts).clone()
    }

    async fn get_file(&self, path: &str) -> Result<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT path, source, hash, mtime, size FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_files(&self) -> Result<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT path, source, hash, mtime, size FROM files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn touch_file(&self, file: &FileRow) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO files (path, source, hash, mtime, size) VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(path) DO UPDATE SET
                 source = excluded.source, hash = excluded.hash,
                 mtime = excluded.mtime, size = excluded.size"#,
        )
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_file(&self, file: &FileRow, model: &str, chunks: &[NewChunk]) -> Result<()> {
        let source = MemorySource::parse(&file.source).unwrap_or(MemorySource::Memory);
        let mut tx = self.pool.begin().await?;
        self.delete_chunks(&mut tx, &file.path).await?;
        self.insert_chunks(&mut tx, &file.path, source, model, chunks)
            .await?;
        sqlx::query(
            r#"INSERT INTO files (path, source, hash, mtime, size) VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(path) DO UPDATE SET
                 source = excluded.source, hash = excluded.hash,
                 mtime = excluded.mtime, size = excluded.size"#,
        )
        .bind(&file.path)
        .bind(&file.source)
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(path = %file.path, chunks = chunks.len(), "replaced file chunks");
        Ok(())
    }

    async fn remove_path(&self, path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.delete_chunks(&mut tx, path).await?;
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM session_files WHERE path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, path: &str) -> Result<Option<SessionFileRow>> {
        let row = sqlx::query_as::<_, SessionFileRow>(
            "SELECT path, last_size, last_line FROM session_files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionFileRow>> {
        let rows = sqlx::query_as::<_, SessionFileRow>(
            "SELECT path, last_size, last_line FROM session_files ORDER BY path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_session(
        &self,
        cursor: &SessionFileRow,
        model: &str,
        chunks: &[NewChunk],
        replace: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if replace {
            self.delete_chunks(&mut tx, &cursor.path).await?;
        }
        self.insert_chunks(&mut tx, &cursor.path, MemorySource::Sessions, model, chunks)
            .await?;
        sqlx::query(
            r#"INSERT INTO session_files (path, last_size, last_line) VALUES (?, ?, ?)
               ON CONFLICT(path) DO UPDATE SET
                 last_size = excluded.last_size, last_line = excluded.last_line"#,
        )
        .bind(&cursor.path)
        .bind(cursor.last_size)
        .bind(cursor.last_line)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn attach_embeddings(&self, items: &[ChunkEmbedding]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for item in items {
            written += sqlx::query(
                r#"INSERT OR REPLACE INTO chunks_vec (id, embedding, dims)
                   SELECT ?1, ?2, ?3
                   WHERE EXISTS (SELECT 1 FROM chunks WHERE id = ?1 AND hash = ?4)"#,
            )
            .bind(&item.id)
            .bind(vector_to_blob(&item.embedding))
            .bind(item.embedding.len() as i64)
            .bind(&item.hash)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn chunks_missing_vectors(&self, dims: usize) -> Result<Vec<UnembeddedChunk>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            r#"SELECT c.id, c.path, c.hash, c.text
               FROM chunks c LEFT JOIN chunks_vec v ON v.id = c.id
               WHERE v.id IS NULL OR v.dims != ?
               ORDER BY c.path, c.id"#,
        )
        .bind(dims as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, path, hash, text)| UnembeddedChunk {
                id,
                path,
                hash,
                text,
            })
            .collect())
    }

    async fn cache_get(
        &self,
        fingerprint: &Fingerprint,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for batch in hashes.chunks(IN_CLAUSE_BATCH) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT hash, embedding FROM embedding_cache WHERE provider = ",
            );
            qb.push_bind(fingerprint.provider.clone())
                .push(" AND model = ")
                .push_bind(fingerprint.model.clone())
                .push(" AND provider_key = ")
                .push_bind(fingerprint.provider_key.clone())
                .push(" AND dims = ")
                .push_bind(fingerprint.dims as i64)
                .push(" AND hash IN (");
            let mut list = qb.separated(", ");
            for hash in batch {
                list.push_bind(hash.clone());
            }
            list.push_unseparated(")");
            let rows: Vec<(String, Vec<u8>)> =
                qb.build_query_as().fetch_all(&self.pool).await?;
            if rows.is_empty() {
                continue;
            }

            let mut touch = QueryBuilder::<Sqlite>::new("UPDATE embedding_cache SET updated_at = ");
            touch
                .push_bind(self.stamp())
                .push(" WHERE provider = ")
                .push_bind(fingerprint.provider.clone())
                .push(" AND model = ")
                .push_bind(fingerprint.model.clone())
                .push(" AND provider_key = ")
                .push_bind(fingerprint.provider_key.clone())
                .push(" AND hash IN (");
            let mut list = touch.separated(", ");
            for (hash, _) in &rows {
                list.push_bind(hash.clone());
            }
            list.push_unseparated(")");
            touch.build().execute(&self.pool).await?;

            found.extend(
                rows.into_iter()
                    .map(|(hash, blob)| (hash, blob_to_vector(&blob))),
            );
        }
        Ok(found)
    }

    async fn cache_put(
        &self,
        fingerprint: &Fingerprint,
        entries: &[(String, Vec<f32>)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (hash, embedding) in entries {
            sqlx::query(
                r#"INSERT OR REPLACE INTO embedding_cache
                   (provider, model, provider_key, hash, embedding, dims, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(&fingerprint.provider)
            .bind(&fingerprint.model)
            .bind(&fingerprint.provider_key)
            .bind(hash)
            .bind(vector_to_blob(embedding))
            .bind(embedding.len() as i64)
            .bind(self.stamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cache_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn cache_prune(&self, keep: usize) -> Result<usize> {
        let count = self.cache_count().await?;
        if count <= keep {
            return Ok(0);
        }
        let excess = (count - keep) as i64;
        let removed = sqlx::query(
            "DELETE FROM embedding_cache WHERE rowid IN \
             (SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?)",
        )
        .bind(excess)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed as usize)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        limit: usize,
        source: Option<MemorySource>,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query_as::<_, VectorRow>(
            r#"SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, c.updated_at,
                      v.embedding
               FROM chunks_vec v JOIN chunks c ON c.id = v.id
               WHERE v.dims = ?1 AND (?2 IS NULL OR c.source = ?2)"#,
        )
        .bind(query.len() as i64)
        .bind(source.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|row| {
                let score = cosine_similarity(query, &blob_to_vector(&row.embedding));
                SearchHit {
                    id: row.id,
                    path: row.path,
                    source: row.source,
                    start_line: row.start_line,
                    end_line: row.end_line,
                    text: row.text,
                    updated_at: row.updated_at,
                    score,
                }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        fts_query: &str,
        limit: usize,
        source: Option<MemorySource>,
    ) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query_as::<_, KeywordRow>(
            r#"SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text, c.updated_at,
                      bm25(chunks_fts) AS bm25_rank
               FROM chunks_fts JOIN chunks c ON c.id = chunks_fts.id
               WHERE chunks_fts MATCH ?1 AND (?2 IS NULL OR c.source = ?2)
               ORDER BY bm25_rank ASC, c.updated_at DESC
               LIMIT ?3"#,
        )
        .bind(fts_query)
        .bind(source.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                score: bm25_relevance(row.bm25_rank),
                id: row.id,
                path: row.path,
                source: row.source,
                start_line: row.start_line,
                end_line: row.end_line,
                text: row.text,
                updated_at: row.updated_at,
            })
            .collect())
    }

    async fn counts(&self) -> Result<IndexCounts> {
        let files: i64 = sqlx::query_scalar("SELECT count(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let session_files: i64 = sqlx::query_scalar("SELECT count(*) FROM session_files")
            .fetch_one(&self.pool)
            .await?;
        let per_source: Vec<(String, i64)> =
            sqlx::query_as("SELECT source, count(*) FROM chunks GROUP BY source")
                .fetch_all(&self.pool)
                .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT count(*) FROM chunks_vec")
            .fetch_one(&self.pool)
            .await?;
        Ok(IndexCounts {
            files: files as usize,
            session_files: session_files as usize,
            chunks: per_source
                .into_iter()
                .map(|(source, n)| (source, n as usize))
                .collect(),
            vectors: vectors as usize,
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
