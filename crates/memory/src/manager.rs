//! The memory index manager: owns the store, the provider selector and the
//! batch dispatcher, schedules sync passes and answers queries.
//!
//! Background work runs as tasks wired by channels. The watcher forwards
//! change events into a single debounce task; the debounce task coalesces
//! bursts (a short window for memory files, a longer fixed window for session
//! transcripts) and starts sync passes. A pass already in flight is shared
//! with every caller that asks for a sync while it runs. Flags raised during a
//! pass schedule a follow-up pass so no change is missed.

use std::{
    collections::{HashMap, HashSet},
    path::{Component, Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::future::{BoxFuture, FutureExt, Shared},
    recall_config::MemorySource,
    serde::Serialize,
    tokio::{
        sync::mpsc,
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "file-watcher")]
use crate::watcher::{MemoryFileWatcher, WatchTargets};
use crate::{
    batch::{BatchDispatcher, Breaker},
    cache::EmbeddingCache,
    config::MemoryConfig,
    embeddings::{EmbeddingProvider, ProviderKind},
    error::{MemoryError, Result},
    provider::{ProviderSelector, ProviderStatus},
    schema::run_migrations,
    search::{MemorySearchResult, SearchMode, search_index},
    store::{IndexAvailability, MemoryStore},
    store_sqlite::{SqliteMemoryStore, open_pool},
    sync::{
        DeferredEmbeddings, SessionScope, SyncEngine, SyncReport, count_newlines, session_key,
    },
};

type SharedSync = Shared<BoxFuture<'static, Result<SyncReport>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Growth observed on one session transcript since its last flush.
#[derive(Debug, Clone, Default)]
struct SessionDelta {
    last_size: u64,
    pending_bytes: u64,
    pending_messages: u64,
}

enum IndexEvent {
    Memory,
    Session(PathBuf),
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
}

/// Snapshot of a manager for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub db_path: String,
    pub db_size_bytes: Option<u64>,
    pub sources: Vec<MemorySource>,
    pub files: usize,
    pub session_files: usize,
    pub chunks: HashMap<String, usize>,
    pub vectors: usize,
    pub provider: ProviderStatus,
    pub vector: IndexAvailability,
    pub fts: IndexAvailability,
    pub cache: CacheStatus,
    pub breaker: Breaker,
    pub dirty: bool,
    pub sessions_dirty: bool,
    pub syncing: bool,
    pub pending_embedding_jobs: usize,
    pub sync_count: u64,
    pub last_sync: Option<SyncReport>,
}

/// Result of an on-demand embedding provider probe.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingProbe {
    pub ok: bool,
    pub provider: Option<ProviderKind>,
    pub error: Option<String>,
}

/// A line slice of a memory file.
#[derive(Debug, Clone, Serialize)]
pub struct FileSlice {
    pub path: String,
    pub from: usize,
    pub lines: usize,
    pub total_lines: usize,
    pub text: String,
}

struct ManagerInner {
    config: Arc<MemoryConfig>,
    engine: SyncEngine,
    dirty: AtomicBool,
    /// Transcripts whose growth crossed a threshold, or that shrank or vanished.
    dirty_sessions: Mutex<HashSet<PathBuf>>,
    /// The session window elapsed; the next pass flushes `dirty_sessions`.
    session_flush_due: AtomicBool,
    /// The next pass reads every transcript.
    full_session_scan: AtomicBool,
    session_deltas: Mutex<HashMap<String, SessionDelta>>,
    in_flight: Mutex<Option<SharedSync>>,
    embed_jobs: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<IndexEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    last_report: Mutex<Option<SyncReport>>,
    passes: AtomicU64,
    #[cfg(feature = "file-watcher")]
    watcher: Mutex<Option<MemoryFileWatcher>>,
}

/// Handle to one agent's memory index. Cheap to clone.
#[derive(Clone)]
pub struct MemoryIndexManager {
    inner: Arc<ManagerInner>,
}

impl MemoryIndexManager {
    /// Open the index described by `config`, with providers built from its settings.
    pub async fn open(config: MemoryConfig) -> Result<Self> {
        let selector = ProviderSelector::from_settings(&config.provider, config.probe_timeout);
        Self::open_with_selector(config, selector).await
    }

    /// Open with explicit embedding candidates, most preferred first.
    pub async fn open_with_providers(
        config: MemoryConfig,
        providers: Vec<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let selector = ProviderSelector::new("auto", providers, config.probe_timeout);
        Self::open_with_selector(config, selector).await
    }

    pub async fn open_with_selector(config: MemoryConfig, selector: ProviderSelector) -> Result<Self> {
        config.validate()?;
        let pool = open_pool(&config.db_path).await?;
        run_migrations(&pool).await?;
        let store = Arc::new(SqliteMemoryStore::with_sub_indices(
            pool,
            config.vector_enabled,
            config.fts_enabled,
        ));

        let vector = store.probe_vector(config.probe_timeout).await;
        let fts = store.probe_fts(config.probe_timeout).await;
        debug!(?vector, ?fts, "memory sub-index availability");

        let selector = Arc::new(selector);
        if let Err(e) = selector.resolve().await {
            store.close().await;
            return Err(e);
        }

        let config = Arc::new(config);
        let store: Arc<dyn MemoryStore> = store;
        let engine = SyncEngine {
            config: Arc::clone(&config),
            cache: Arc::new(EmbeddingCache::new(Arc::clone(&store), config.cache.clone())),
            dispatcher: Arc::new(BatchDispatcher::new(config.batch.clone())),
            store,
            selector,
        };

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config: Arc::clone(&config),
            engine,
            // The index may predate changes made while no manager was running.
            dirty: AtomicBool::new(true),
            dirty_sessions: Mutex::new(HashSet::new()),
            session_flush_due: AtomicBool::new(false),
            full_session_scan: AtomicBool::new(config.source_enabled(MemorySource::Sessions)),
            session_deltas: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(None),
            embed_jobs: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            events,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_report: Mutex::new(None),
            passes: AtomicU64::new(0),
            #[cfg(feature = "file-watcher")]
            watcher: Mutex::new(None),
        });
        inner.spawn_background(rx);

        info!(
            agent = %config.agent_id,
            db = %config.db_path,
            "memory index manager opened"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run a sync pass over everything now, or join the one already running.
    /// A joined pass that did not cover every transcript is followed by one that does.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.ensure_open()?;
        self.inner.full_session_scan.store(true, Ordering::SeqCst);
        let report = self.inner.start_sync("manual").await?;
        if !self.inner.full_session_scan.load(Ordering::SeqCst) {
            return Ok(report);
        }
        self.inner.start_sync("manual").await
    }

    /// Ranked matches for `query`. `limit` defaults to `query.max_results`.
    pub async fn search(
        &self,
        query: &str,
        source: Option<MemorySource>,
        limit: Option<usize>,
    ) -> Result<Vec<MemorySearchResult>> {
        Ok(self.search_with_mode(query, source, limit).await?.1)
    }

    /// Like [`Self::search`], also reporting which sub-indices answered.
    pub async fn search_with_mode(
        &self,
        query: &str,
        source: Option<MemorySource>,
        limit: Option<usize>,
    ) -> Result<(SearchMode, Vec<MemorySearchResult>)> {
        self.ensure_open()?;
        let query = query.trim();
        if query.is_empty() {
            return Err(MemoryError::InvalidQuery("query is empty".into()));
        }
        let limit = limit.unwrap_or(self.inner.config.query.max_results);
        if limit == 0 {
            return Err(MemoryError::InvalidQuery("limit must be positive".into()));
        }

        let inner = &self.inner;
        if inner.config.sync.on_search
            && (inner.dirty.load(Ordering::SeqCst)
                || inner.session_flush_due.load(Ordering::SeqCst))
        {
            // Background pass; this query sees the last committed state.
            drop(inner.start_sync("search"));
        }

        let query_vector = inner.embed_query(query).await;
        search_index(
            inner.engine.store.as_ref(),
            query,
            query_vector.as_deref(),
            limit,
            source,
            &inner.config.query,
        )
        .await
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        self.ensure_open()?;
        let inner = &self.inner;
        let engine = &inner.engine;
        let counts = engine.store.counts().await?;
        let cache_entries = engine.cache.entry_count().await?;
        let provider = engine.selector.status().await;
        let breaker = engine.dispatcher.breaker().await;
        let db_size_bytes = if inner.config.db_path == ":memory:" {
            None
        } else {
            tokio::fs::metadata(&inner.config.db_path)
                .await
                .ok()
                .map(|m| m.len())
        };
        let pending_embedding_jobs = lock(&inner.embed_jobs)
            .iter()
            .filter(|h| !h.is_finished())
            .count();
        let syncing = lock(&inner.in_flight).is_some();
        let last_sync = lock(&inner.last_report).clone();
        Ok(MemoryStatus {
            agent_id: inner.config.agent_id.clone(),
            workspace_dir: inner.config.workspace_dir.clone(),
            db_path: inner.config.db_path.clone(),
            db_size_bytes,
            sources: inner.config.sources.clone(),
            files: counts.files,
            session_files: counts.session_files,
            chunks: counts.chunks,
            vectors: counts.vectors,
            provider,
            vector: engine.store.vector_availability(),
            fts: engine.store.fts_availability(),
            cache: CacheStatus {
                enabled: engine.cache.enabled(),
                entries: cache_entries,
                max_entries: inner.config.cache.max_entries,
            },
            breaker,
            dirty: inner.dirty.load(Ordering::SeqCst),
            sessions_dirty: !lock(&inner.dirty_sessions).is_empty()
                || inner.full_session_scan.load(Ordering::SeqCst),
            syncing,
            pending_embedding_jobs,
            sync_count: inner.passes.load(Ordering::SeqCst),
            last_sync,
        })
    }

    /// Number of sync passes started so far.
    pub fn sync_count(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        lock(&self.inner.last_report).clone()
    }

    pub async fn probe_vector_availability(&self) -> Result<IndexAvailability> {
        self.ensure_open()?;
        Ok(self
            .inner
            .engine
            .store
            .probe_vector(self.inner.config.probe_timeout)
            .await)
    }

    pub async fn probe_embedding_availability(&self) -> Result<EmbeddingProbe> {
        self.ensure_open()?;
        let Some(provider) = self.inner.engine.selector.current().await else {
            return Ok(EmbeddingProbe {
                ok: false,
                provider: None,
                error: Some("no active embedding provider".into()),
            });
        };
        let timeout = self.inner.config.probe_timeout;
        let error = match tokio::time::timeout(timeout, provider.probe()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("probe timed out after {timeout:?}")),
        };
        Ok(EmbeddingProbe {
            ok: error.is_none(),
            provider: Some(provider.kind()),
            error,
        })
    }

    /// Read `lines` lines of a memory file starting at 1-based line `from`.
    pub async fn read_file(
        &self,
        rel_path: &str,
        from: Option<usize>,
        lines: Option<usize>,
    ) -> Result<FileSlice> {
        self.ensure_open()?;
        let abs = self.resolve_memory_path(rel_path)?;
        let content = tokio::fs::read_to_string(&abs).await?;
        let all: Vec<&str> = content.lines().collect();
        let from = from.unwrap_or(1).max(1);
        let start = (from - 1).min(all.len());
        let end = match lines {
            Some(n) => start.saturating_add(n).min(all.len()),
            None => all.len(),
        };
        Ok(FileSlice {
            path: rel_path.trim().to_string(),
            from,
            lines: end - start,
            total_lines: all.len(),
            text: all[start..end].join("\n"),
        })
    }

    /// Map a caller-supplied path onto a markdown file under the memory roots.
    fn resolve_memory_path(&self, rel_path: &str) -> Result<PathBuf> {
        let rel_path = rel_path.trim();
        let invalid = |why: &str| MemoryError::InvalidPath(format!("{rel_path}: {why}"));
        if rel_path.is_empty() {
            return Err(invalid("path is empty"));
        }
        let candidate = Path::new(rel_path);
        if candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(invalid("parent directory references are not allowed"));
        }
        if !matches!(
            candidate.extension().and_then(|e| e.to_str()),
            Some("md" | "markdown")
        ) {
            return Err(invalid("only markdown files can be read"));
        }
        let abs = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.inner.config.workspace_dir.join(candidate)
        };
        if self
            .inner
            .config
            .memory_roots()
            .iter()
            .any(|root| abs.starts_with(root))
        {
            Ok(abs)
        } else {
            Err(invalid("outside the memory roots"))
        }
    }

    /// Note a change to a memory file; a pass follows after the watch debounce.
    pub fn record_memory_event(&self) {
        self.inner.record_memory_event();
    }

    /// Note growth of a session transcript; it is flushed after the session debounce.
    pub fn record_session_event(&self, path: impl Into<PathBuf>) {
        self.inner.record_session_event(path.into());
    }

    /// Wait until every deferred embedding job has finished.
    pub async fn wait_for_embeddings(&self) {
        loop {
            let jobs: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.inner.embed_jobs));
            if jobs.is_empty() {
                return;
            }
            for job in jobs {
                if let Err(e) = job.await
                    && !e.is_cancelled()
                {
                    warn!(error = %e, "deferred embedding job panicked");
                }
            }
        }
    }

    /// Forget a fallback and try the candidates again from the most preferred.
    /// A different provider changes the fingerprint, so the next pass rebuilds.
    /// When no candidate answers, the index continues without vectors.
    pub async fn reset_provider(&self) -> Result<ProviderStatus> {
        self.ensure_open()?;
        let engine = &self.inner.engine;
        engine.selector.reset().await;
        let resolved = engine.selector.resolve().await;
        // Either way the index metadata no longer matches the selection.
        self.inner.dirty.store(true, Ordering::SeqCst);
        resolved?;
        engine.dispatcher.reset_breaker().await;
        let status = engine.selector.status().await;
        info!(active = ?status.active, "embedding provider re-resolved");
        Ok(status)
    }

    /// Close the circuit breaker so the next pass dispatches embeddings again.
    pub async fn reset_breaker(&self) {
        self.inner.engine.dispatcher.reset_breaker().await;
    }

    /// Stop background work and close the store. Later calls return [`MemoryError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.cancel.cancel();
        #[cfg(feature = "file-watcher")]
        drop(lock(&inner.watcher).take());
        for task in std::mem::take(&mut *lock(&inner.tasks)) {
            task.abort();
        }

        let in_flight = lock(&inner.in_flight).take();
        if let Some(pass) = in_flight {
            // The pass observes the token between file writes.
            let _ = pass.await;
        }
        let jobs: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&inner.embed_jobs));
        for job in jobs {
            let _ = job.await;
        }

        inner.engine.store.close().await;
        info!(agent = %inner.config.agent_id, "memory index manager closed");
        Ok(())
    }
}

impl ManagerInner {
    fn start_sync(self: &Arc<Self>, reason: &'static str) -> SharedSync {
        let mut slot = lock(&self.in_flight);
        if let Some(pass) = slot.as_ref() {
            debug!(reason, "joining in-flight memory sync");
            return pass.clone();
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_sync(reason).await });
        let cancel = self.cancel.clone();
        let pass = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() || cancel.is_cancelled() => Err(MemoryError::Closed),
                Err(e) => Err(MemoryError::IndexUnavailable(format!("sync task failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        *slot = Some(pass.clone());
        pass
    }

    /// Which transcripts this pass reads. Memory-only passes leave session
    /// growth pending until its window elapses.
    fn take_session_scope(&self) -> SessionScope {
        if self.full_session_scan.swap(false, Ordering::SeqCst) {
            self.session_flush_due.store(false, Ordering::SeqCst);
            lock(&self.dirty_sessions).clear();
            for delta in lock(&self.session_deltas).values_mut() {
                delta.pending_bytes = 0;
                delta.pending_messages = 0;
            }
            return SessionScope::All;
        }
        if self.session_flush_due.swap(false, Ordering::SeqCst) {
            return SessionScope::Only(std::mem::take(&mut *lock(&self.dirty_sessions)));
        }
        SessionScope::none()
    }

    /// Put an unread scope back so a later pass picks it up.
    fn restore_session_scope(&self, scope: SessionScope) {
        match scope {
            SessionScope::All => self.full_session_scan.store(true, Ordering::SeqCst),
            SessionScope::Only(paths) if !paths.is_empty() => {
                lock(&self.dirty_sessions).extend(paths);
                self.session_flush_due.store(true, Ordering::SeqCst);
            },
            SessionScope::Only(_) => {},
        }
    }

    async fn run_sync(self: Arc<Self>, reason: &'static str) -> Result<SyncReport> {
        self.dirty.store(false, Ordering::SeqCst);
        let scope = self.take_session_scope();
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(reason, pass, ?scope, "memory sync started");

        // A running deferred job still owes vectors for the chunks it holds.
        let backfill = lock(&self.embed_jobs).iter().all(|h| h.is_finished());
        let result = self.engine.run_pass(scope.clone(), backfill, &self.cancel).await;
        lock(&self.in_flight).take();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if !matches!(e, MemoryError::Closed) {
                    warn!(reason, error = %e, "memory sync failed");
                    self.dirty.store(true, Ordering::SeqCst);
                    self.restore_session_scope(scope);
                }
                return Err(e);
            },
        };

        let report = outcome.report;
        if let Some(job) = outcome.deferred {
            self.spawn_embed_job(job);
        }
        if report.provider_demoted {
            // The new provider's fingerprint forces a rebuild on the next pass.
            self.dirty.store(true, Ordering::SeqCst);
        }
        *lock(&self.last_report) = Some(report.clone());

        if !self.cancel.is_cancelled()
            && (self.dirty.load(Ordering::SeqCst)
                || self.session_flush_due.load(Ordering::SeqCst)
                || self.full_session_scan.load(Ordering::SeqCst))
        {
            debug!("changes arrived during sync, scheduling another pass");
            drop(self.start_sync("follow-up"));
        }
        Ok(report)
    }

    fn spawn_embed_job(self: &Arc<Self>, job: DeferredEmbeddings) {
        let inner = Arc::clone(self);
        let items = job.items.len();
        let handle = tokio::spawn(async move {
            match inner.engine.complete_deferred(job, &inner.cancel).await {
                Ok(report) => {
                    debug!(
                        attached = report.chunks_indexed,
                        batches_failed = report.batches_failed,
                        "deferred embeddings attached"
                    );
                    if report.provider_demoted && !inner.cancel.is_cancelled() {
                        inner.dirty.store(true, Ordering::SeqCst);
                        drop(inner.start_sync("provider fallback"));
                    }
                },
                Err(MemoryError::Closed) => debug!("deferred embedding job discarded"),
                Err(e) => warn!(error = %e, "deferred embedding job failed"),
            }
        });
        debug!(items, "deferred embedding job started");
        lock(&self.embed_jobs).push(handle);
    }

    /// Embed the query, or `None` to search lexically.
    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let engine = &self.engine;
        if !engine.store.vector_availability().is_ready() {
            return None;
        }
        if engine.dispatcher.breaker().await.is_open() {
            debug!("circuit breaker open, searching without a query embedding");
            return None;
        }
        let provider = engine.selector.current().await?;
        let settings = engine.dispatcher.settings();
        let timeout = if provider.kind().is_local() {
            settings.query_timeout_local
        } else {
            settings.query_timeout_remote
        };
        match tokio::time::timeout(timeout, provider.embed_query(query)).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(e)) => {
                warn!(provider = %provider.kind(), error = %e, "query embedding failed, using keyword search");
                None
            },
            Err(_) => {
                warn!(provider = %provider.kind(), ?timeout, "query embedding timed out, using keyword search");
                None
            },
        }
    }

    fn record_memory_event(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self.events.send(IndexEvent::Memory);
    }

    fn record_session_event(&self, path: PathBuf) {
        let _ = self.events.send(IndexEvent::Session(path));
    }

    /// Fold new growth of a transcript into its delta. True when the delta
    /// crosses the flush thresholds (any growth when both are zero).
    async fn note_session_growth(&self, path: &Path) -> bool {
        let Some(key) = session_key(&self.config, path) else {
            return false;
        };
        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(_) => {
                // Deleted: the next flush drops its chunks.
                lock(&self.session_deltas).remove(&key);
                lock(&self.dirty_sessions).insert(path.to_path_buf());
                return true;
            },
        };

        let known = lock(&self.session_deltas).get(&key).map(|d| d.last_size);
        let baseline = match known {
            Some(size) => size,
            None => match self.engine.store.get_session(&key).await {
                Ok(row) => row.map_or(0, |r| r.last_size.max(0) as u64),
                Err(e) => {
                    warn!(path = %key, error = %e, "failed to read session cursor");
                    0
                },
            },
        };

        if size < baseline {
            debug!(path = %key, size, baseline, "session transcript shrank");
            lock(&self.session_deltas).insert(key, SessionDelta {
                last_size: size,
                ..Default::default()
            });
            lock(&self.dirty_sessions).insert(path.to_path_buf());
            return true;
        }
        if size == baseline {
            return false;
        }

        let messages = count_newlines(path, baseline, size).await.unwrap_or(0);
        let sync = &self.config.sync;
        let mut deltas = lock(&self.session_deltas);
        let delta = deltas.entry(key).or_default();
        delta.last_size = size;
        delta.pending_bytes += size - baseline;
        delta.pending_messages += messages;

        let qualifies = (sync.session_delta_bytes == 0 && sync.session_delta_messages == 0)
            || (sync.session_delta_bytes > 0 && delta.pending_bytes >= sync.session_delta_bytes)
            || (sync.session_delta_messages > 0
                && delta.pending_messages >= sync.session_delta_messages);
        if qualifies {
            delta.pending_bytes = 0;
            delta.pending_messages = 0;
            drop(deltas);
            lock(&self.dirty_sessions).insert(path.to_path_buf());
        }
        qualifies
    }

    fn spawn_background(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<IndexEvent>) {
        let mut tasks = vec![tokio::spawn(debounce_loop(
            Arc::downgrade(self),
            rx,
            self.cancel.clone(),
            self.config.sync.watch_debounce,
            self.config.sync.session_debounce,
        ))];

        if let Some(period) = self.config.sync.interval {
            tasks.push(tokio::spawn(interval_loop(
                Arc::downgrade(self),
                self.cancel.clone(),
                period,
            )));
        }
        tasks.push(tokio::spawn(reap_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
            self.config.batch.poll_interval,
        )));

        if self.config.sync.watch {
            tasks.extend(self.start_watcher());
        }

        lock(&self.tasks).extend(tasks);
    }

    #[cfg(feature = "file-watcher")]
    fn start_watcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let config = &self.config;
        let targets = WatchTargets {
            memory_roots: if config.source_enabled(MemorySource::Memory) {
                config.memory_roots()
            } else {
                Vec::new()
            },
            sessions_dir: config
                .source_enabled(MemorySource::Sessions)
                .then(|| config.sessions_dir.clone()),
        };
        let (watcher, mut rx) = match MemoryFileWatcher::start(targets, config.sync.watch_debounce) {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "file watcher unavailable, relying on explicit syncs");
                return None;
            },
        };
        *lock(&self.watcher) = Some(watcher);

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        match event.source {
                            MemorySource::Memory => inner.record_memory_event(),
                            MemorySource::Sessions => inner.record_session_event(event.path),
                        }
                    },
                }
            }
        }))
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn debounce_loop(
    weak: Weak<ManagerInner>,
    mut rx: mpsc::UnboundedReceiver<IndexEvent>,
    cancel: CancellationToken,
    watch_debounce: Duration,
    session_debounce: Duration,
) {
    let mut memory_deadline: Option<Instant> = None;
    let mut session_deadline: Option<Instant> = None;
    loop {
        let next = memory_deadline.into_iter().chain(session_deadline).min();
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    IndexEvent::Memory => {
                        memory_deadline = Some(Instant::now() + watch_debounce);
                    },
                    IndexEvent::Session(path) => {
                        // Fixed window: later growth joins the pending flush.
                        if inner.note_session_growth(&path).await && session_deadline.is_none() {
                            session_deadline = Some(Instant::now() + session_debounce);
                        }
                    },
                }
            },
            _ = sleep_until_opt(next) => {
                let now = Instant::now();
                let Some(inner) = weak.upgrade() else { break };
                let mut reason = "watch";
                if memory_deadline.is_some_and(|d| d <= now) {
                    memory_deadline = None;
                }
                if session_deadline.is_some_and(|d| d <= now) {
                    session_deadline = None;
                    inner.session_flush_due.store(true, Ordering::SeqCst);
                    reason = "session delta";
                }
                drop(inner.start_sync(reason));
            },
        }
    }
}

async fn interval_loop(weak: Weak<ManagerInner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                drop(inner.start_sync("interval"));
            },
        }
    }
}

/// Drop handles of finished deferred embedding jobs every poll interval.
async fn reap_loop(weak: Weak<ManagerInner>, cancel: CancellationToken, poll: Duration) {
    let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                let mut jobs = lock(&inner.embed_jobs);
                jobs.retain(|h| !h.is_finished());
                if !jobs.is_empty() {
                    debug!(pending = jobs.len(), "deferred embedding jobs still running");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::error::EmbeddingError,
        async_trait::async_trait,
        std::{io::Write, sync::atomic::AtomicUsize},
    };

    const KEYWORDS: [&str; 8] = [
        "rust", "python", "database", "memory", "search", "network", "cooking", "music",
    ];

    /// Bag-of-keywords embedder with call counters and switchable failures.
    struct MockEmbedder {
        kind: ProviderKind,
        model: String,
        calls: AtomicUsize,
        texts: AtomicUsize,
        fail: AtomicBool,
        outage: AtomicBool,
        probe_ok: AtomicBool,
        delay_ms: AtomicU64,
    }

    impl MockEmbedder {
        fn new(kind: ProviderKind, model: &str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                model: model.into(),
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                outage: AtomicBool::new(false),
                probe_ok: AtomicBool::new(true),
                delay_ms: AtomicU64::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn texts(&self) -> usize {
            self.texts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockEmbedder {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.outage.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Unavailable {
                    provider: self.kind.as_str().into(),
                    message: "HTTP 401: key revoked".into(),
                    transient: false,
                });
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Unknown("mock failure".into()));
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let lower = t.to_lowercase();
                    KEYWORDS
                        .iter()
                        .map(|k| lower.matches(k).count() as f32)
                        .collect()
                })
                .collect())
        }

        async fn probe(&self) -> Result<(), EmbeddingError> {
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(EmbeddingError::Unavailable {
                    provider: self.kind.as_str().into(),
                    message: "no credentials".into(),
                    transient: false,
                })
            }
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        fn dimensions(&self) -> usize {
            KEYWORDS.len()
        }

        fn provider_key(&self) -> &str {
            "mock"
        }
    }

    fn test_config(ws: &Path) -> MemoryConfig {
        let mut config = MemoryConfig::for_workspace("test", ws);
        config.db_path = ws.join("index.sqlite").to_string_lossy().into_owned();
        config.sessions_dir = ws.join("sessions");
        config.sync.watch = false;
        config.sync.on_search = false;
        config.query.min_score = 0.0;
        config.batch.retry_base_delay = Duration::from_millis(1);
        config.batch.retry_max_delay = Duration::from_millis(2);
        config
    }

    async fn open(config: MemoryConfig, providers: &[Arc<MockEmbedder>]) -> MemoryIndexManager {
        MemoryIndexManager::open_with_providers(
            config,
            providers
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn EmbeddingProvider>)
                .collect(),
        )
        .await
        .unwrap()
    }

    fn write(ws: &Path, rel: &str, content: &str) {
        let path = ws.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// A user message line of exactly `len` bytes, newline included.
    fn message_line(len: usize) -> String {
        let head = r#"{"role":"user","content":""#;
        let tail = "\"}\n";
        format!("{head}{}{tail}", "a".repeat(len - head.len() - tail.len()))
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    async fn wait_for_passes(manager: &MemoryIndexManager, count: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.sync_count() < count || manager.status().await.unwrap().syncing {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unchanged_files_make_no_embedding_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/rust.md", "# Rust\nrust memory safety notes");
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(test_config(ws), &[Arc::clone(&embedder)]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.files_updated, 1);
        let calls = embedder.calls();
        assert!(calls > 0);

        // Same content rewritten: mtime may move, hash does not.
        write(ws, "memory/rust.md", "# Rust\nrust memory safety notes");
        let second = manager.sync().await.unwrap();
        assert_eq!(second.files_updated, 0);
        assert_eq!(second.files_unchanged, 1);
        assert_eq!(embedder.calls(), calls);
    }

    #[tokio::test]
    async fn hybrid_search_ranks_relevant_file_first() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "# Profile\nlikes cooking and music");
        write(ws, "memory/db.md", "database search tuning for rust services");
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(test_config(ws), &[embedder]).await;
        manager.sync().await.unwrap();

        let (mode, results) = manager
            .search_with_mode("database search", None, None)
            .await
            .unwrap();
        assert_eq!(mode, SearchMode::Hybrid);
        assert_eq!(results[0].path, "memory/db.md");
        assert_eq!(results[0].source, MemorySource::Memory);
        assert!(results[0].score > 0.0 && results[0].score <= 1.0);
    }

    fn two_chunk_text(last: &str) -> String {
        let mut lines: Vec<String> = (0..19)
            .map(|i| format!("{i:02}{}", "a".repeat(38)))
            .collect();
        lines.push(last.to_string());
        lines.join("\n")
    }

    async fn edit_last_line(cache_enabled: bool) -> (usize, usize) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/a.md", &two_chunk_text(&format!("19{}", "a".repeat(38))));
        let mut config = test_config(ws);
        config.chunk_tokens = 120;
        config.chunk_overlap = 20;
        config.cache.enabled = cache_enabled;
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(config, &[Arc::clone(&embedder)]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.chunks_indexed, 2);
        let before = embedder.texts();

        write(ws, "memory/a.md", &two_chunk_text("19 the last line changed"));
        let second = manager.sync().await.unwrap();
        assert_eq!(second.files_updated, 1);
        assert_eq!(second.chunks_indexed, 2);
        let status = manager.status().await.unwrap();
        assert_eq!(status.chunks.get("memory"), Some(&2));
        (second.cache_hits, embedder.texts() - before)
    }

    #[tokio::test]
    async fn edited_file_replaces_all_chunks() {
        assert_eq!(edit_last_line(false).await, (0, 2));
    }

    #[tokio::test]
    async fn cache_spares_unchanged_chunks_of_edited_file() {
        assert_eq!(edit_last_line(true).await, (1, 1));
    }

    #[tokio::test]
    async fn session_appends_are_indexed_once() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = test_config(ws);
        config.sources = vec![MemorySource::Memory, MemorySource::Sessions];
        let transcript = ws.join("sessions/s1.jsonl");
        write(
            ws,
            "sessions/s1.jsonl",
            concat!(
                r#"{"role":"user","content":"how do I tune the database"}"#,
                "\n",
                r#"{"message":{"role":"assistant","content":[{"type":"text","text":"add an index"}]}}"#,
                "\n",
            ),
        );
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.session_files_read, 1);
        assert!(first.chunks_indexed > 0);

        let again = manager.sync().await.unwrap();
        assert_eq!(again.session_files_read, 0);
        assert_eq!(again.chunks_indexed, 0);

        let line = r#"{"role":"user","content":"and the network"}"#.to_string() + "\n";
        append(&transcript, &line);
        let third = manager.sync().await.unwrap();
        assert_eq!(third.session_bytes_read, line.len() as u64);

        let results = manager
            .search("database", Some(MemorySource::Sessions), None)
            .await
            .unwrap();
        assert_eq!(results[0].path, "sessions/s1.jsonl");
        assert_eq!(results[0].start_line, 1);
        assert!(results[0].snippet.starts_with("User: how do I tune"));
    }

    #[tokio::test]
    async fn partial_trailing_line_waits_for_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = test_config(ws);
        config.sources = vec![MemorySource::Sessions];
        let transcript = ws.join("sessions/s.jsonl");
        write(ws, "sessions/s.jsonl", r#"{"role":"user","content":"rust"#);
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.session_bytes_read, 0);
        assert_eq!(first.chunks_indexed, 0);

        append(&transcript, " music\"}\n");
        let second = manager.sync().await.unwrap();
        assert_eq!(second.chunks_indexed, 1);
        let hits = manager.search("music", None, None).await.unwrap();
        assert!(hits[0].snippet.contains("rust music"));
    }

    #[tokio::test]
    async fn truncated_transcript_is_reindexed_from_start() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = test_config(ws);
        config.sources = vec![MemorySource::Sessions];
        write(ws, "sessions/s.jsonl", &message_line(300).repeat(3));
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.sync().await.unwrap();

        write(
            ws,
            "sessions/s.jsonl",
            &(r#"{"role":"assistant","content":"cooking tips"}"#.to_string() + "\n"),
        );
        let report = manager.sync().await.unwrap();
        assert_eq!(report.sessions_reset, 1);
        let status = manager.status().await.unwrap();
        assert_eq!(status.chunks.get("sessions"), Some(&1));
    }

    #[tokio::test]
    async fn session_growth_in_one_window_is_read_once() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = test_config(ws);
        config.sources = vec![MemorySource::Sessions];
        config.sync.session_debounce = Duration::from_millis(300);
        let transcript = ws.join("sessions/s.jsonl");
        write(ws, "sessions/s.jsonl", &message_line(250).repeat(4));
        assert_eq!(std::fs::metadata(&transcript).unwrap().len(), 1000);

        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        let first = manager.sync().await.unwrap();
        assert_eq!(first.session_bytes_read, 1000);
        let passes = manager.sync_count();

        append(&transcript, &message_line(250));
        manager.record_session_event(&transcript);
        append(&transcript, &message_line(250));
        manager.record_session_event(&transcript);

        wait_for_passes(&manager, passes + 1).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(manager.sync_count(), passes + 1);
        let report = manager.last_report().unwrap();
        assert_eq!(report.session_files_read, 1);
        assert_eq!(report.session_bytes_read, 500);
    }

    fn mixed_sources_config(ws: &Path) -> MemoryConfig {
        let mut config = test_config(ws);
        config.sources = vec![MemorySource::Memory, MemorySource::Sessions];
        config.sync.watch_debounce = Duration::from_millis(50);
        config.sync.session_debounce = Duration::from_secs(60);
        config
    }

    #[tokio::test]
    async fn memory_edits_leave_small_session_growth_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = mixed_sources_config(ws);
        config.sync.session_delta_bytes = 1_000_000;
        let transcript = ws.join("sessions/s.jsonl");
        write(ws, "sessions/s.jsonl", &message_line(100));
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        assert_eq!(manager.sync().await.unwrap().session_bytes_read, 100);
        let passes = manager.sync_count();

        append(&transcript, &message_line(100));
        manager.record_session_event(&transcript);
        write(ws, "memory/n.md", "music notes");
        manager.record_memory_event();

        wait_for_passes(&manager, passes + 1).await;
        let report = manager.last_report().unwrap();
        assert_eq!(report.files_updated, 1);
        assert_eq!(report.session_files_read, 0);
        assert_eq!(report.session_bytes_read, 0);
        assert!(!manager.status().await.unwrap().sessions_dirty);

        // An explicit sync reads every transcript regardless of thresholds.
        let report = manager.sync().await.unwrap();
        assert_eq!(report.session_bytes_read, 100);
    }

    #[tokio::test]
    async fn memory_edits_do_not_cut_the_session_window_short() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let transcript = ws.join("sessions/s.jsonl");
        write(ws, "sessions/s.jsonl", &message_line(100));
        let manager = open(mixed_sources_config(ws), &[MockEmbedder::new(
            ProviderKind::OpenAi,
            "m1",
        )])
        .await;
        manager.sync().await.unwrap();
        let passes = manager.sync_count();

        append(&transcript, &message_line(120));
        manager.record_session_event(&transcript);
        write(ws, "memory/n.md", "music notes");
        manager.record_memory_event();

        wait_for_passes(&manager, passes + 1).await;
        let report = manager.last_report().unwrap();
        assert_eq!(report.files_updated, 1);
        assert_eq!(report.session_bytes_read, 0);
        // Qualified growth stays queued for the session window.
        assert!(manager.status().await.unwrap().sessions_dirty);

        let report = manager.sync().await.unwrap();
        assert_eq!(report.session_files_read, 1);
        assert_eq!(report.session_bytes_read, 120);
        assert!(!manager.status().await.unwrap().sessions_dirty);
    }

    #[tokio::test]
    async fn memory_events_are_debounced_into_one_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let mut config = test_config(ws);
        config.sync.watch_debounce = Duration::from_millis(100);
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.sync().await.unwrap();
        let passes = manager.sync_count();

        for i in 0..5 {
            write(ws, &format!("memory/n{i}.md"), "music notes");
            manager.record_memory_event();
        }
        wait_for_passes(&manager, passes + 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.sync_count(), passes + 1);
        assert_eq!(manager.status().await.unwrap().files, 5);
    }

    #[tokio::test]
    async fn concurrent_syncs_share_one_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "rust");
        let manager = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;

        let (a, b) = tokio::join!(manager.sync(), manager.sync());
        assert_eq!(manager.sync_count(), 1);
        assert_eq!(a.unwrap().files_updated, 1);
        assert_eq!(b.unwrap().files_updated, 1);
    }

    #[tokio::test]
    async fn breaker_stops_embedding_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        for (i, topic) in ["rust", "python", "network"].iter().enumerate() {
            write(ws, &format!("memory/{i}.md"), topic);
        }
        let mut config = test_config(ws);
        config.batch.max_tokens = 1;
        config.batch.concurrency = 1;
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        embedder.fail.store(true, Ordering::SeqCst);
        let manager = open(config, &[Arc::clone(&embedder)]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.batches_failed, 2);
        assert_eq!(first.files_updated, 3);
        assert!(manager.status().await.unwrap().breaker.is_open());
        let calls = embedder.calls();

        write(ws, "memory/3.md", "cooking");
        let second = manager.sync().await.unwrap();
        assert!(second.embedding_skipped);
        assert_eq!(embedder.calls(), calls);

        // Lexical search still works and does not embed the query.
        let (mode, results) = manager.search_with_mode("cooking", None, None).await.unwrap();
        assert_eq!(mode, SearchMode::KeywordOnly);
        assert_eq!(results[0].path, "memory/3.md");
        assert_eq!(embedder.calls(), calls);

        embedder.fail.store(false, Ordering::SeqCst);
        manager.reset_breaker().await;
        write(ws, "memory/4.md", "music");
        manager.sync().await.unwrap();
        assert!(embedder.calls() > calls);
    }

    #[tokio::test]
    async fn fallback_provider_stays_selected() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "rust");
        let primary = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        primary.probe_ok.store(false, Ordering::SeqCst);
        let local = MockEmbedder::new(ProviderKind::Local, "m1");
        let manager = open(test_config(ws), &[Arc::clone(&primary), Arc::clone(&local)]).await;

        manager.sync().await.unwrap();
        let status = manager.status().await.unwrap();
        assert_eq!(status.provider.active, Some(ProviderKind::Local));
        assert!(matches!(status.provider.state, crate::provider::ProviderState::Fallback { .. }));

        primary.probe_ok.store(true, Ordering::SeqCst);
        write(ws, "memory/more.md", "python");
        manager.sync().await.unwrap();
        manager.search("python", None, None).await.unwrap();
        assert_eq!(primary.calls(), 0);
        assert!(local.calls() > 0);
    }

    #[tokio::test]
    async fn reset_provider_returns_to_preferred_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "rust");
        let primary = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        primary.probe_ok.store(false, Ordering::SeqCst);
        let local = MockEmbedder::new(ProviderKind::Local, "m1");
        let manager = open(test_config(ws), &[Arc::clone(&primary), Arc::clone(&local)]).await;
        manager.sync().await.unwrap();
        assert_eq!(
            manager.status().await.unwrap().provider.active,
            Some(ProviderKind::Local)
        );

        primary.probe_ok.store(true, Ordering::SeqCst);
        let status = manager.reset_provider().await.unwrap();
        assert_eq!(status.active, Some(ProviderKind::OpenAi));
        assert!(manager.status().await.unwrap().dirty);

        let report = manager.sync().await.unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.files_updated, 1);
        assert!(primary.calls() > 0);
        assert_eq!(manager.status().await.unwrap().vectors, 1);
    }

    #[tokio::test]
    async fn reset_provider_fails_when_no_candidate_answers() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let only = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(test_config(ws), &[Arc::clone(&only)]).await;

        only.probe_ok.store(false, Ordering::SeqCst);
        assert!(matches!(
            manager.reset_provider().await,
            Err(MemoryError::ProviderUnavailable(_))
        ));
        let status = manager.status().await.unwrap();
        assert_eq!(status.provider.active, None);
        assert!(status.dirty);
    }

    #[tokio::test]
    async fn permanent_outage_rebuilds_with_next_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "rust");
        let primary = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let local = MockEmbedder::new(ProviderKind::Local, "m1");
        let manager = open(test_config(ws), &[Arc::clone(&primary), Arc::clone(&local)]).await;
        manager.sync().await.unwrap();
        assert_eq!(local.calls(), 0);

        primary.outage.store(true, Ordering::SeqCst);
        write(ws, "memory/new.md", "music");
        let report = manager.sync().await.unwrap();
        assert!(report.provider_demoted);

        // The demotion schedules a follow-up pass that rebuilds in the new space.
        wait_for_passes(&manager, 3).await;
        let status = manager.status().await.unwrap();
        assert_eq!(status.provider.active, Some(ProviderKind::Local));
        assert!(manager.last_report().unwrap().rebuilt);
        assert_eq!(status.vectors, 2);
        assert!(local.calls() > 0);
    }

    #[tokio::test]
    async fn disabled_vector_index_searches_lexically() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/r.md", "rust ownership rules");
        let mut config = test_config(ws);
        config.vector_enabled = false;
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(config, &[Arc::clone(&embedder)]).await;
        manager.sync().await.unwrap();

        let (mode, results) = manager.search_with_mode("ownership", None, None).await.unwrap();
        assert_eq!(mode, SearchMode::KeywordOnly);
        assert_eq!(results[0].path, "memory/r.md");
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn no_healthy_sub_index_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/r.md", "rust");
        let mut config = test_config(ws);
        config.vector_enabled = false;
        config.fts_enabled = false;
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.sync().await.unwrap();
        assert!(matches!(
            manager.search("rust", None, None).await,
            Err(MemoryError::IndexUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn deferred_embeddings_attach_in_background() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/a.md", "rust memory");
        write(ws, "memory/b.md", "python network");
        let mut config = test_config(ws);
        config.batch.wait = false;
        let manager = open(config, &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;

        let report = manager.sync().await.unwrap();
        assert_eq!(report.embeddings_deferred, 2);
        manager.wait_for_embeddings().await;

        let status = manager.status().await.unwrap();
        assert_eq!(status.vectors, 2);
        assert_eq!(status.cache.entries, 2);
        let (mode, _) = manager.search_with_mode("python", None, None).await.unwrap();
        assert_eq!(mode, SearchMode::Hybrid);
    }

    #[tokio::test]
    async fn interrupted_deferred_embeddings_complete_after_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/a.md", "rust memory");
        let mut config = test_config(ws);
        config.batch.wait = false;

        let slow = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        slow.delay_ms.store(500, Ordering::SeqCst);
        let manager = open(config.clone(), &[slow]).await;
        assert_eq!(manager.sync().await.unwrap().embeddings_deferred, 1);
        manager.close().await.unwrap();

        let fast = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        let manager = open(config, &[Arc::clone(&fast)]).await;
        assert_eq!(manager.status().await.unwrap().vectors, 0);
        let report = manager.sync().await.unwrap();
        assert!(!report.rebuilt);
        assert_eq!(report.files_updated, 0);
        assert_eq!(report.embeddings_deferred, 1);
        manager.wait_for_embeddings().await;

        assert!(fast.calls() > 0);
        assert_eq!(manager.status().await.unwrap().vectors, 1);
    }

    #[tokio::test]
    async fn chunks_from_failed_batches_are_embedded_later() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/a.md", "rust memory");
        let mut config = test_config(ws);
        config.batch.max_attempts = 1;
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        embedder.fail.store(true, Ordering::SeqCst);
        let manager = open(config, &[Arc::clone(&embedder)]).await;

        let first = manager.sync().await.unwrap();
        assert_eq!(first.batches_failed, 1);
        assert_eq!(manager.status().await.unwrap().vectors, 0);

        embedder.fail.store(false, Ordering::SeqCst);
        manager.reset_breaker().await;
        let second = manager.sync().await.unwrap();
        assert_eq!(second.files_updated, 0);
        assert_eq!(second.vectors_backfilled, 1);
        assert_eq!(manager.status().await.unwrap().vectors, 1);

        let third = manager.sync().await.unwrap();
        assert_eq!(third.vectors_backfilled, 0);
        assert_eq!(third.cache_misses, 0);
    }

    #[tokio::test]
    async fn same_size_edit_with_restored_mtime_is_reindexed() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        let path = ws.join("memory/n.md");
        write(ws, "memory/n.md", "rust notes");
        let manager = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.sync().await.unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        write(ws, "memory/n.md", "music note");
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10);

        let report = manager.sync().await.unwrap();
        assert_eq!(report.files_updated, 1);
        let results = manager.search("music", None, None).await.unwrap();
        assert_eq!(results[0].path, "memory/n.md");
        assert!(results[0].snippet.contains("music note"));
    }

    #[tokio::test]
    async fn deleted_files_leave_the_index() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/keep.md", "rust");
        write(ws, "memory/gone.md", "cooking recipes");
        let manager = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.sync().await.unwrap();

        std::fs::remove_file(ws.join("memory/gone.md")).unwrap();
        let report = manager.sync().await.unwrap();
        assert_eq!(report.files_removed, 1);
        let results = manager.search("recipes", None, None).await.unwrap();
        assert!(results.iter().all(|r| r.path != "memory/gone.md"));
    }

    #[tokio::test]
    async fn model_change_rebuilds_index() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "MEMORY.md", "rust");

        let first = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        assert!(!first.sync().await.unwrap().rebuilt);
        first.close().await.unwrap();

        let second = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m2")]).await;
        let report = second.sync().await.unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.files_updated, 1);
        assert!(!second.sync().await.unwrap().rebuilt);
    }

    #[tokio::test]
    async fn read_file_stays_inside_memory_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path();
        write(ws, "memory/notes.md", "one\ntwo\nthree\nfour");
        write(ws, "secret.md", "nope");
        let manager = open(test_config(ws), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;

        let slice = manager.read_file("memory/notes.md", Some(2), Some(2)).await.unwrap();
        assert_eq!(slice.text, "two\nthree");
        assert_eq!(slice.total_lines, 4);

        for bad in ["secret.md", "memory/../secret.md", "memory/notes.txt", ""] {
            assert!(
                matches!(manager.read_file(bad, None, None).await, Err(MemoryError::InvalidPath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn queries_are_validated() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = open(test_config(tmp.path()), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        assert!(matches!(manager.search("  ", None, None).await, Err(MemoryError::InvalidQuery(_))));
        assert!(matches!(
            manager.search("rust", None, Some(0)).await,
            Err(MemoryError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn open_fails_without_any_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = MockEmbedder::new(ProviderKind::OpenAi, "m1");
        embedder.probe_ok.store(false, Ordering::SeqCst);
        let result = MemoryIndexManager::open_with_providers(test_config(tmp.path()), vec![
            embedder as Arc<dyn EmbeddingProvider>,
        ])
        .await;
        assert!(matches!(result, Err(MemoryError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn closed_manager_rejects_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = open(test_config(tmp.path()), &[MockEmbedder::new(ProviderKind::OpenAi, "m1")]).await;
        manager.close().await.unwrap();
        assert!(manager.is_closed());
        assert!(matches!(manager.sync().await, Err(MemoryError::Closed)));
        assert!(matches!(manager.search("rust", None, None).await, Err(MemoryError::Closed)));
        manager.close().await.unwrap();
    }
}
