use std::{path::PathBuf, sync::Arc};

use {
    anyhow::{Context, Result},
    recall_memory::{ManagerRegistry, MemoryConfig, MemoryIndexManager, MemorySource},
    tracing::{info, warn},
};

/// Global options shared by every command.
pub struct Settings {
    pub config: Option<PathBuf>,
    pub workspace: PathBuf,
    pub agent: String,
}

pub fn parse_source(raw: &str) -> Result<MemorySource, String> {
    MemorySource::parse(raw).ok_or_else(|| format!("unknown source '{raw}' (memory, sessions)"))
}

fn resolve_config(settings: &Settings) -> Result<MemoryConfig> {
    let file = match &settings.config {
        Some(path) => recall_config::load_config(path)?,
        None => recall_config::discover_and_load(),
    };
    let workspace = std::fs::canonicalize(&settings.workspace)
        .with_context(|| format!("workspace {} not found", settings.workspace.display()))?;
    Ok(MemoryConfig::resolve(&file.memory, &settings.agent, workspace)?)
}

/// Open the manager, run `f`, then close everything the registry holds.
async fn with_manager<F, Fut>(config: MemoryConfig, f: F) -> Result<()>
where
    F: FnOnce(Arc<MemoryIndexManager>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let registry = ManagerRegistry::new();
    let manager = registry.get_or_open(config).await?;
    let result = f(manager).await;
    if let Err(e) = registry.close_all().await {
        warn!(error = %e, "failed to close memory index");
    }
    result
}

pub async fn sync(settings: &Settings) -> Result<()> {
    let mut config = resolve_config(settings)?;
    config.sync.watch = false;
    with_manager(config, |manager| async move {
        let report = manager.sync().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    })
    .await
}

pub async fn search(
    settings: &Settings,
    query: &str,
    source: Option<MemorySource>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let mut config = resolve_config(settings)?;
    config.sync.watch = false;
    with_manager(config, |manager| async move {
        manager.sync().await?;
        let (mode, results) = manager.search_with_mode(query, source, limit).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&results)?);
            return Ok(());
        }
        if results.is_empty() {
            println!("no matches ({mode:?})");
            return Ok(());
        }
        for r in &results {
            println!(
                "{:.3}  {}:{}-{}  [{}]",
                r.score,
                r.path,
                r.start_line,
                r.end_line,
                r.source.as_str()
            );
            for line in r.snippet.lines().take(3) {
                println!("    {line}");
            }
        }
        Ok(())
    })
    .await
}

pub async fn status(settings: &Settings, json: bool) -> Result<()> {
    let mut config = resolve_config(settings)?;
    config.sync.watch = false;
    with_manager(config, |manager| async move {
        let status = manager.status().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        println!("agent:      {}", status.agent_id);
        println!("workspace:  {}", status.workspace_dir.display());
        println!(
            "database:   {} ({} bytes)",
            status.db_path,
            status.db_size_bytes.unwrap_or(0)
        );
        println!(
            "provider:   {} -> {} ({})",
            status.provider.requested,
            status
                .provider
                .active
                .map_or_else(|| "none".to_string(), |k| k.to_string()),
            status.provider.model.as_deref().unwrap_or("-")
        );
        println!("files:      {} memory, {} sessions", status.files, status.session_files);
        let mut chunks: Vec<_> = status.chunks.iter().collect();
        chunks.sort();
        for (source, n) in chunks {
            println!("chunks:     {n} {source}");
        }
        println!("vectors:    {}", status.vectors);
        println!("vector idx: {:?}", status.vector);
        println!("fts idx:    {:?}", status.fts);
        println!(
            "cache:      {} / {} entries{}",
            status.cache.entries,
            status.cache.max_entries,
            if status.cache.enabled { "" } else { " (disabled)" }
        );
        println!("breaker:    {:?}", status.breaker);
        Ok(())
    })
    .await
}

pub async fn read(
    settings: &Settings,
    path: &str,
    from: Option<usize>,
    lines: Option<usize>,
) -> Result<()> {
    let mut config = resolve_config(settings)?;
    config.sync.watch = false;
    with_manager(config, |manager| async move {
        let slice = manager.read_file(path, from, lines).await?;
        println!("{}", slice.text);
        Ok(())
    })
    .await
}

pub async fn watch(settings: &Settings) -> Result<()> {
    let mut config = resolve_config(settings)?;
    config.sync.watch = true;
    with_manager(config, |manager| async move {
        let report = manager.sync().await?;
        info!(
            files = report.files_updated,
            chunks = report.chunks_indexed,
            "initial sync complete, watching for changes"
        );
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        Ok(())
    })
    .await
}
