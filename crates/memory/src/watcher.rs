//! Real-time file watching for memory sync using notify-debouncer-full.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    notify_debouncer_full::{
        DebounceEventResult, Debouncer, RecommendedCache, new_debouncer,
        notify::{EventKind, RecommendedWatcher, RecursiveMode},
    },
    recall_config::MemorySource,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    Modified,
    Removed,
}

/// A relevant change under one of the watched roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub source: MemorySource,
    pub kind: WatchKind,
}

/// Which roots feed which source.
#[derive(Debug, Clone, Default)]
pub struct WatchTargets {
    pub memory_roots: Vec<PathBuf>,
    pub sessions_dir: Option<PathBuf>,
}

impl WatchTargets {
    /// Classify a path: markdown under a memory root, `.jsonl` under the sessions dir.
    pub fn classify(&self, path: &Path) -> Option<MemorySource> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if let Some(dir) = &self.sessions_dir
            && ext == "jsonl"
            && path.starts_with(dir)
        {
            return Some(MemorySource::Sessions);
        }
        if matches!(ext, "md" | "markdown") && self.memory_roots.iter().any(|r| path.starts_with(r)) {
            return Some(MemorySource::Memory);
        }
        None
    }

    /// Directories to register: a file root is watched through its parent.
    fn watch_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .memory_roots
            .iter()
            .filter_map(|root| {
                if root.is_dir() {
                    Some(root.clone())
                } else if root.is_file() {
                    root.parent().map(Path::to_path_buf)
                } else {
                    None
                }
            })
            .chain(self.sessions_dir.iter().filter(|d| d.is_dir()).cloned())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }
}

/// Watches memory roots and session transcripts with debouncing.
pub struct MemoryFileWatcher {
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
}

impl MemoryFileWatcher {
    /// Start watching. Missing roots are skipped. Returns the watcher and its event stream.
    pub fn start(
        targets: WatchTargets,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let dirs = targets.watch_dirs();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        let kind = match event.kind {
                            EventKind::Create(_) => WatchKind::Created,
                            EventKind::Modify(_) => WatchKind::Modified,
                            EventKind::Remove(_) => WatchKind::Removed,
                            _ => continue,
                        };
                        for path in &event.paths {
                            let Some(source) = targets.classify(path) else {
                                continue;
                            };
                            debug!(path = %path.display(), ?kind, "file watcher event");
                            if tx
                                .send(WatchEvent {
                                    path: path.clone(),
                                    source,
                                    kind,
                                })
                                .is_err()
                            {
                                return; // receiver dropped
                            }
                        }
                    }
                },
                Err(errors) => {
                    for e in errors {
                        warn!(error = %e, "file watcher error");
                    }
                },
            }
        })
        .map_err(|e| MemoryError::Config(format!("file watcher: {e}")))?;

        for dir in &dirs {
            debouncer
                .watch(dir, RecursiveMode::Recursive)
                .map_err(|e| MemoryError::Config(format!("watch {}: {e}", dir.display())))?;
            info!(dir = %dir.display(), "file watcher: watching directory");
        }

        Ok((Self {
            _debouncer: debouncer,
        }, rx))
    }
}
