//! SQLite tables backing the memory index, and their row types.
//!
//! `chunks_fts` is not created here: the lexical sub-index is created by
//! its availability probe so a missing FTS5 build only disables keyword search.

use sqlx::SqlitePool;

/// Key of the index metadata singleton in the `meta` table.
pub const META_KEY: &str = "memory_index_meta_v1";
pub const FTS_TABLE: &str = "chunks_fts";

/// A tracked memory markdown file.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileRow {
    pub path: String,
    pub source: String,
    pub hash: String,
    pub mtime: i64,
    pub size: i64,
}

/// Read position of an append-only session transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionFileRow {
    pub path: String,
    /// Byte offset already consumed; always at a line boundary.
    pub last_size: i64,
    /// Number of complete lines consumed so far.
    pub last_line: i64,
}

/// Create every table the index needs. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS files (
            path   TEXT PRIMARY KEY,
            source TEXT NOT NULL DEFAULT 'memory',
            hash   TEXT NOT NULL,
            mtime  INTEGER NOT NULL,
            size   INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS session_files (
            path      TEXT PRIMARY KEY,
            last_size INTEGER NOT NULL DEFAULT 0,
            last_line INTEGER NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS chunks (
            id         TEXT PRIMARY KEY,
            path       TEXT NOT NULL,
            source     TEXT NOT NULL DEFAULT 'memory',
            start_line INTEGER NOT NULL,
            end_line   INTEGER NOT NULL,
            hash       TEXT NOT NULL,
            model      TEXT NOT NULL DEFAULT '',
            text       TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)",
        r#"CREATE TABLE IF NOT EXISTS chunks_vec (
            id        TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            dims      INTEGER NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS embedding_cache (
            provider     TEXT NOT NULL,
            model        TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            hash         TEXT NOT NULL,
            embedding    BLOB NOT NULL,
            dims         INTEGER NOT NULL,
            updated_at   INTEGER NOT NULL,
            PRIMARY KEY (provider, model, provider_key, hash)
        )"#,
        "CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at)",
    ];
    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in ["chunks", "chunks_vec", "embedding_cache", "files", "meta", "session_files"] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
        assert!(!names.contains(&FTS_TABLE));
    }
}
