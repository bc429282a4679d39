//! One sync pass: diff memory files and session transcripts against the
//! tracked state, chunk what changed, resolve vectors through the cache and
//! the batch dispatcher, then commit each file atomically.

use std::{
    collections::{HashMap, HashSet},
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, UNIX_EPOCH},
};

use {
    recall_config::MemorySource,
    serde::Serialize,
    serde_json::Value,
    tokio::io::{AsyncReadExt, AsyncSeekExt},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    walkdir::WalkDir,
};

use crate::{
    batch::{BatchDispatcher, PendingEmbedding},
    cache::EmbeddingCache,
    chunker::{chunk_markdown, hash_text},
    config::{MemoryConfig, SESSION_DELTA_READ_CHUNK_BYTES},
    embeddings::{EmbeddingProvider, Fingerprint},
    error::{MemoryError, Result},
    provider::ProviderSelector,
    schema::{FileRow, SessionFileRow},
    store::{ChunkEmbedding, IndexMeta, MemoryStore, NewChunk},
};

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub files_updated: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub session_files_read: usize,
    pub session_files_removed: usize,
    /// Transcripts that shrank and were re-read from the start.
    pub sessions_reset: usize,
    pub session_bytes_read: u64,
    pub chunks_indexed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub batches_ok: usize,
    pub batches_failed: usize,
    /// Misses handed to a background job (`batch.wait = false`).
    pub embeddings_deferred: usize,
    /// Embedding dispatch was skipped (breaker open or no provider).
    pub embedding_skipped: bool,
    pub provider_demoted: bool,
    /// Vectors written for chunks left unembedded by an earlier pass.
    pub vectors_backfilled: usize,
    /// Stored metadata disagreed with the active configuration.
    pub rebuilt: bool,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// A tracked file on disk and its index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub key: String,
    pub abs: PathBuf,
}

/// Which session transcripts a pass reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionScope {
    /// Every transcript under the sessions directory; stale cursors are dropped.
    All,
    /// Only these transcripts. Empty reads none.
    Only(HashSet<PathBuf>),
}

impl SessionScope {
    pub fn none() -> Self {
        Self::Only(HashSet::new())
    }
}

/// Vectors still owed for chunks already written.
#[derive(Debug, Clone)]
pub struct DeferredEmbeddings {
    pub fingerprint: Fingerprint,
    pub items: Vec<PendingEmbedding>,
}

pub struct PassOutcome {
    pub report: SyncReport,
    pub deferred: Option<DeferredEmbeddings>,
}

struct PreparedFile {
    row: FileRow,
    chunks: Vec<NewChunk>,
}

struct PreparedSession {
    cursor: SessionFileRow,
    chunks: Vec<NewChunk>,
    replace: bool,
}

/// Complete lines read from a transcript starting at some offset.
#[derive(Debug, Default)]
pub struct SessionTail {
    /// Bytes up to and including the last newline.
    pub consumed: u64,
    pub lines: Vec<String>,
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md" | "markdown")
    )
}

/// Index key of a memory file: workspace-relative when possible.
pub fn memory_key(config: &MemoryConfig, abs: &Path) -> String {
    match abs.strip_prefix(&config.workspace_dir) {
        Ok(rel) => slash_path(rel),
        Err(_) => abs.to_string_lossy().into_owned(),
    }
}

/// Index key of a session transcript, `None` outside the sessions directory.
pub fn session_key(config: &MemoryConfig, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(&config.sessions_dir).ok()?;
    Some(format!("sessions/{}", slash_path(rel)))
}

/// Every markdown file under the memory roots, deduplicated by key.
pub fn list_memory_files(config: &MemoryConfig) -> Vec<SourceFile> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for root in config.memory_roots() {
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(true).into_iter().flatten() {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_markdown(path) {
                continue;
            }
            let key = memory_key(config, path);
            if seen.insert(key.clone()) {
                out.push(SourceFile {
                    key,
                    abs: path.to_path_buf(),
                });
            }
        }
    }
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

pub fn list_session_files(config: &MemoryConfig) -> Vec<SourceFile> {
    if !config.sessions_dir.exists() {
        return Vec::new();
    }
    let mut out: Vec<SourceFile> = WalkDir::new(&config.sessions_dir)
        .follow_links(true)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .filter_map(|e| {
            session_key(config, e.path()).map(|key| SourceFile {
                key,
                abs: e.path().to_path_buf(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Render one transcript line as `User: ...` / `Assistant: ...`.
///
/// Accepts `{role, content}` or `{message: {role, content}}`; `content` is a
/// string or an array of `{type: "text", text}` parts. Other roles, tool
/// payloads and malformed lines yield `None`.
pub fn parse_session_line(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let message = value
        .get("message")
        .filter(|m| m.is_object())
        .unwrap_or(&value);
    let label = match message.get("role")?.as_str()? {
        "user" => "User",
        "assistant" => "Assistant",
        _ => return None,
    };
    let raw = match message.get("content")? {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) if part.get("type").and_then(Value::as_str) == Some("text") => {
                    part.get("text").and_then(Value::as_str)
                },
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(format!("{label}: {text}"))
    }
}

/// Read from `offset` to EOF, keeping only complete lines.
pub async fn read_complete_lines(path: &Path, offset: u64) -> std::io::Result<SessionTail> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; SESSION_DELTA_READ_CHUNK_BYTES];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    let text = String::from_utf8_lossy(&buf[..end]);
    Ok(SessionTail {
        consumed: end as u64,
        lines: text
            .split_terminator('\n')
            .map(|l| l.trim_end_matches('\r').to_string())
            .collect(),
    })
}

/// Count newline bytes in `[from, to)` of a file.
pub async fn count_newlines(path: &Path, from: u64, to: u64) -> std::io::Result<u64> {
    if to <= from {
        return Ok(0);
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(from)).await?;
    let mut remaining = to - from;
    let mut chunk = vec![0u8; SESSION_DELTA_READ_CHUNK_BYTES];
    let mut count = 0u64;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        count += chunk[..n].iter().filter(|b| **b == b'\n').count() as u64;
        remaining -= n as u64;
    }
    Ok(count)
}

fn unique_by_hash(items: &[PendingEmbedding]) -> Vec<PendingEmbedding> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|p| seen.insert(p.hash.clone()))
        .cloned()
        .collect()
}

/// Everything a pass needs; shared by the manager and its background jobs.
pub struct SyncEngine {
    pub config: Arc<MemoryConfig>,
    pub store: Arc<dyn MemoryStore>,
    pub cache: Arc<EmbeddingCache>,
    pub selector: Arc<ProviderSelector>,
    pub dispatcher: Arc<BatchDispatcher>,
}

impl SyncEngine {
    /// Embeddings are only worth computing when the vector sub-index can use them.
    fn embeddings_wanted(&self) -> bool {
        self.config.batch.enabled && self.store.vector_availability().is_ready()
    }

    fn expected_meta(&self, provider: Option<&dyn EmbeddingProvider>) -> IndexMeta {
        match provider {
            Some(p) => IndexMeta {
                provider: p.kind().as_str().to_string(),
                model: p.model_name().to_string(),
                provider_key: p.provider_key().to_string(),
                chunk_tokens: self.config.chunk_tokens,
                chunk_overlap: self.config.chunk_overlap,
                vector_dims: p.dimensions(),
            },
            None => IndexMeta {
                provider: "none".to_string(),
                model: String::new(),
                provider_key: String::new(),
                chunk_tokens: self.config.chunk_tokens,
                chunk_overlap: self.config.chunk_overlap,
                vector_dims: 0,
            },
        }
    }

    /// Run one pass over the memory roots and the transcripts in `sessions`.
    /// With `backfill`, stored chunks lacking a vector are embedded too.
    /// Storage errors abort it; per-file read errors are recorded.
    pub async fn run_pass(
        &self,
        sessions: SessionScope,
        backfill: bool,
        cancel: &CancellationToken,
    ) -> Result<PassOutcome> {
        let started = Instant::now();
        let mut report = SyncReport::default();

        let provider = if self.embeddings_wanted() {
            self.selector.current().await
        } else {
            None
        };
        let expected = self.expected_meta(provider.as_deref());
        match self.store.read_meta().await? {
            Some(stored) if stored == expected => {},
            Some(stored) => {
                warn!(
                    changes = %stored.diff(&expected).join(", "),
                    "memory index metadata changed, rebuilding"
                );
                self.store.reset_index().await?;
                self.store.write_meta(&expected).await?;
                report.rebuilt = true;
            },
            None => self.store.write_meta(&expected).await?,
        }
        let model = expected.model.clone();
        // Session cursors went with the reset.
        let sessions = if report.rebuilt {
            SessionScope::All
        } else {
            sessions
        };

        let mut files = self.collect_memory(&mut report, cancel).await?;
        let mut sessions = self.collect_sessions(&sessions, &mut report, cancel).await?;

        let mut deferred = None;
        let mut attach: Vec<ChunkEmbedding> = Vec::new();
        if let Some(provider) = &provider {
            let fingerprint = Fingerprint::of(provider.as_ref());
            let backlog = if backfill {
                self.backlog(&files, &sessions, fingerprint.dims).await?
            } else {
                Vec::new()
            };
            let mut chunks: Vec<&mut NewChunk> = files
                .iter_mut()
                .flat_map(|f| f.chunks.iter_mut())
                .chain(sessions.iter_mut().flat_map(|s| s.chunks.iter_mut()))
                .collect();

            let hashes: Vec<String> = chunks
                .iter()
                .map(|c| c.hash.clone())
                .chain(backlog.iter().map(|b| b.hash.clone()))
                .collect();
            let hits = self.cache.get_many(&fingerprint, &hashes).await?;
            let mut misses = Vec::new();
            for chunk in chunks.iter_mut() {
                match hits.get(&chunk.hash) {
                    Some(vector) => {
                        chunk.embedding = Some(vector.clone());
                        report.cache_hits += 1;
                    },
                    None => {
                        misses.push(PendingEmbedding {
                            id: chunk.id.clone(),
                            hash: chunk.hash.clone(),
                            text: chunk.text.clone(),
                        });
                        report.cache_misses += 1;
                    },
                }
            }
            let mut backlog_misses = Vec::new();
            for item in backlog {
                match hits.get(&item.hash) {
                    Some(vector) => {
                        attach.push(ChunkEmbedding {
                            id: item.id,
                            hash: item.hash,
                            embedding: vector.clone(),
                        });
                        report.cache_hits += 1;
                    },
                    None => {
                        backlog_misses.push(item);
                        report.cache_misses += 1;
                    },
                }
            }

            if !misses.is_empty() || !backlog_misses.is_empty() {
                if self.config.batch.wait {
                    let pending: Vec<PendingEmbedding> =
                        misses.iter().chain(&backlog_misses).cloned().collect();
                    let vectors = self
                        .embed_unique(&fingerprint, &pending, cancel, &mut report)
                        .await?;
                    for chunk in chunks.iter_mut() {
                        if chunk.embedding.is_none()
                            && let Some(vector) = vectors.get(&chunk.hash)
                        {
                            chunk.embedding = Some(vector.clone());
                        }
                    }
                    attach.extend(backlog_misses.into_iter().filter_map(|item| {
                        vectors.get(&item.hash).map(|v| ChunkEmbedding {
                            id: item.id,
                            hash: item.hash,
                            embedding: v.clone(),
                        })
                    }));
                } else {
                    misses.extend(backlog_misses);
                    report.embeddings_deferred = misses.len();
                    deferred = Some(DeferredEmbeddings {
                        fingerprint,
                        items: misses,
                    });
                }
            }
        }

        for file in &files {
            if cancel.is_cancelled() {
                return Err(MemoryError::Closed);
            }
            self.store.replace_file(&file.row, &model, &file.chunks).await?;
            report.files_updated += 1;
            report.chunks_indexed += file.chunks.len();
        }
        for session in &sessions {
            if cancel.is_cancelled() {
                return Err(MemoryError::Closed);
            }
            self.store
                .append_session(&session.cursor, &model, &session.chunks, session.replace)
                .await?;
            report.chunks_indexed += session.chunks.len();
        }
        if !attach.is_empty() {
            report.vectors_backfilled = self.store.attach_embeddings(&attach).await?;
            debug!(vectors = report.vectors_backfilled, "backfilled missing vectors");
        }

        self.cache.prune().await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            updated = report.files_updated,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            sessions = report.session_files_read,
            chunks = report.chunks_indexed,
            backfilled = report.vectors_backfilled,
            cache_hits = report.cache_hits,
            cache_misses = report.cache_misses,
            rebuilt = report.rebuilt,
            duration_ms = report.duration_ms,
            "memory sync complete"
        );
        Ok(PassOutcome { report, deferred })
    }

    /// Stored chunks still owed a vector, e.g. after a deferred job was cut
    /// short by close or a batch failed. Paths this pass rewrites are skipped.
    async fn backlog(
        &self,
        files: &[PreparedFile],
        sessions: &[PreparedSession],
        dims: usize,
    ) -> Result<Vec<PendingEmbedding>> {
        let rewritten: HashSet<&str> = files
            .iter()
            .map(|f| f.row.path.as_str())
            .chain(
                sessions
                    .iter()
                    .filter(|s| s.replace)
                    .map(|s| s.cursor.path.as_str()),
            )
            .collect();
        Ok(self
            .store
            .chunks_missing_vectors(dims)
            .await?
            .into_iter()
            .filter(|c| !rewritten.contains(c.path.as_str()))
            .map(|c| PendingEmbedding {
                id: c.id,
                hash: c.hash,
                text: c.text,
            })
            .collect())
    }

    /// Dispatch one embedding per distinct hash; store results in the cache.
    async fn embed_unique(
        &self,
        fingerprint: &Fingerprint,
        pending: &[PendingEmbedding],
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<HashMap<String, Vec<f32>>> {
        let dispatch = self
            .dispatcher
            .dispatch(&self.selector, unique_by_hash(pending), cancel)
            .await;
        report.batches_ok += dispatch.batches_ok;
        report.batches_failed += dispatch.batches_failed;
        report.embedding_skipped |= dispatch.skipped;
        report.provider_demoted |= dispatch.demoted;
        report.errors.extend(dispatch.errors.iter().cloned());
        if dispatch.cancelled {
            return Err(MemoryError::Closed);
        }
        if dispatch.fingerprint.as_ref() != Some(fingerprint) {
            // The provider changed before dispatch; these chunks wait for the rebuild.
            return Ok(HashMap::new());
        }
        let entries: Vec<(String, Vec<f32>)> = dispatch
            .embedded
            .into_iter()
            .map(|e| (e.hash, e.embedding))
            .collect();
        self.cache.put_many(fingerprint, &entries).await?;
        Ok(entries.into_iter().collect())
    }

    /// Finish a deferred job: embed, cache, then attach to chunks that still match.
    pub async fn complete_deferred(
        &self,
        job: DeferredEmbeddings,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let vectors = self
            .embed_unique(&job.fingerprint, &job.items, cancel, &mut report)
            .await?;
        if cancel.is_cancelled() {
            return Err(MemoryError::Closed);
        }
        let attach: Vec<ChunkEmbedding> = job
            .items
            .into_iter()
            .filter_map(|item| {
                vectors.get(&item.hash).map(|v| ChunkEmbedding {
                    id: item.id,
                    hash: item.hash,
                    embedding: v.clone(),
                })
            })
            .collect();
        report.chunks_indexed = self.store.attach_embeddings(&attach).await?;
        Ok(report)
    }

    async fn collect_memory(
        &self,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreparedFile>> {
        let mut prepared = Vec::new();
        let discovered = if self.config.source_enabled(MemorySource::Memory) {
            list_memory_files(&self.config)
        } else {
            Vec::new()
        };
        let keys: HashSet<&str> = discovered.iter().map(|f| f.key.as_str()).collect();

        for file in &discovered {
            if cancel.is_cancelled() {
                return Err(MemoryError::Closed);
            }
            match self.prepare_memory_file(file).await {
                Ok(Some(p)) => prepared.push(p),
                Ok(None) => report.files_unchanged += 1,
                Err(MemoryError::Io(e)) => {
                    warn!(path = %file.key, error = %e, "failed to read memory file");
                    report.errors.push(format!("{}: {e}", file.key));
                },
                Err(e) => return Err(e),
            }
        }

        for row in self.store.list_files().await? {
            if !keys.contains(row.path.as_str()) {
                debug!(path = %row.path, "removing stale file from memory index");
                self.store.remove_path(&row.path).await?;
                report.files_removed += 1;
            }
        }
        Ok(prepared)
    }

    async fn prepare_memory_file(&self, file: &SourceFile) -> Result<Option<PreparedFile>> {
        let metadata = tokio::fs::metadata(&file.abs).await?;
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let size = metadata.len() as i64;

        let existing = self.store.get_file(&file.key).await?;
        let content = tokio::fs::read_to_string(&file.abs).await?;
        let hash = hash_text(&content);
        let row = FileRow {
            path: file.key.clone(),
            source: MemorySource::Memory.as_str().to_string(),
            hash: hash.clone(),
            mtime,
            size,
        };
        if let Some(existing) = &existing
            && existing.hash == hash
        {
            if existing.mtime != mtime || existing.size != size {
                self.store.touch_file(&row).await?;
            }
            return Ok(None);
        }

        let chunks = chunk_markdown(&content, self.config.chunk_tokens, self.config.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(i, c)| NewChunk {
                id: format!("{}:{i}", file.key),
                start_line: c.start_line as i64,
                end_line: c.end_line as i64,
                hash: c.hash,
                text: c.text,
                embedding: None,
            })
            .collect();
        debug!(path = %file.key, "memory file changed");
        Ok(Some(PreparedFile { row, chunks }))
    }

    async fn collect_sessions(
        &self,
        scope: &SessionScope,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<PreparedSession>> {
        let mut prepared = Vec::new();
        let enabled = self.config.source_enabled(MemorySource::Sessions);
        let discovered = match scope {
            SessionScope::All if enabled => list_session_files(&self.config),
            SessionScope::All => Vec::new(),
            SessionScope::Only(paths) if enabled => {
                let mut listed: Vec<SourceFile> = paths
                    .iter()
                    .filter_map(|p| {
                        session_key(&self.config, p).map(|key| SourceFile {
                            key,
                            abs: p.clone(),
                        })
                    })
                    .collect();
                listed.sort_by(|a, b| a.key.cmp(&b.key));
                listed.dedup_by(|a, b| a.key == b.key);
                listed
            },
            SessionScope::Only(_) => return Ok(prepared),
        };

        for file in &discovered {
            if cancel.is_cancelled() {
                return Err(MemoryError::Closed);
            }
            if let Err(e) = tokio::fs::metadata(&file.abs).await
                && e.kind() == std::io::ErrorKind::NotFound
            {
                if self.store.get_session(&file.key).await?.is_some() {
                    debug!(path = %file.key, "removing deleted session transcript");
                    self.store.remove_path(&file.key).await?;
                    report.session_files_removed += 1;
                }
                continue;
            }
            match self.prepare_session(file, report).await {
                Ok(Some(p)) => prepared.push(p),
                Ok(None) => {},
                Err(MemoryError::Io(e)) => {
                    warn!(path = %file.key, error = %e, "failed to read session transcript");
                    report.errors.push(format!("{}: {e}", file.key));
                },
                Err(e) => return Err(e),
            }
        }

        if *scope == SessionScope::All {
            let keys: HashSet<&str> = discovered.iter().map(|f| f.key.as_str()).collect();
            for row in self.store.list_sessions().await? {
                if !keys.contains(row.path.as_str()) {
                    debug!(path = %row.path, "removing deleted session transcript");
                    self.store.remove_path(&row.path).await?;
                    report.session_files_removed += 1;
                }
            }
        }
        Ok(prepared)
    }

    async fn prepare_session(
        &self,
        file: &SourceFile,
        report: &mut SyncReport,
    ) -> Result<Option<PreparedSession>> {
        let size = tokio::fs::metadata(&file.abs).await?.len();
        let cursor = self
            .store
            .get_session(&file.key)
            .await?
            .unwrap_or_else(|| SessionFileRow {
                path: file.key.clone(),
                ..Default::default()
            });
        let last_size = cursor.last_size.max(0) as u64;
        if size == last_size {
            return Ok(None);
        }

        let (offset, first_line, replace) = if size < last_size {
            info!(path = %file.key, size, last_size, "session transcript shrank, re-reading from start");
            report.sessions_reset += 1;
            (0, 0, true)
        } else {
            (last_size, cursor.last_line, false)
        };

        let tail = read_complete_lines(&file.abs, offset).await?;
        report.session_files_read += 1;
        report.session_bytes_read += tail.consumed;
        if tail.consumed == 0 && !replace {
            // Only a partial trailing line so far.
            return Ok(None);
        }

        let mut messages = Vec::new();
        let mut line_numbers = Vec::new();
        for (i, raw) in tail.lines.iter().enumerate() {
            if let Some(message) = parse_session_line(raw) {
                messages.push(message);
                line_numbers.push(first_line + i as i64 + 1);
            }
        }
        let line_of = |n: usize| {
            line_numbers
                .get(n.saturating_sub(1))
                .copied()
                .unwrap_or(first_line + 1)
        };
        let chunks = if messages.is_empty() {
            Vec::new()
        } else {
            chunk_markdown(
                &messages.join("\n"),
                self.config.chunk_tokens,
                self.config.chunk_overlap,
            )
            .into_iter()
            .enumerate()
            .map(|(i, c)| NewChunk {
                id: format!("{}:{offset}:{i}", file.key),
                start_line: line_of(c.start_line),
                end_line: line_of(c.end_line),
                hash: c.hash,
                text: c.text,
                embedding: None,
            })
            .collect()
        };

        Ok(Some(PreparedSession {
            cursor: SessionFileRow {
                path: file.key.clone(),
                last_size: (offset + tail.consumed) as i64,
                last_line: first_line + tail.lines.len() as i64,
            },
            chunks,
            replace,
        }))
    }
}
