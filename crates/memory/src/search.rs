//! Query side of the dual index: candidate retrieval from each healthy
//! sub-index and weighted score fusion.
//!
//! Fusion scales each list by its best score, so the top candidate of either
//! sub-index scores 1.0 on that side, then combines
//! `(vector_weight * v + text_weight * t) / (vector_weight + text_weight)`.
//! A chunk missing from one list contributes 0 on that side. Ties go to the
//! more recently synced chunk.

use std::{cmp::Ordering, collections::HashMap};

use {recall_config::MemorySource, serde::Serialize, tracing::debug};

use crate::{
    config::QuerySettings,
    error::{MemoryError, Result},
    store::{MemoryStore, SearchHit},
};

/// One ranked match returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySearchResult {
    pub id: String,
    pub path: String,
    pub source: MemorySource,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f32,
    pub snippet: String,
    #[serde(skip)]
    pub updated_at: i64,
}

/// Which sub-indices answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    VectorOnly,
    KeywordOnly,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Map an FTS5 `bm25()` rank (more negative is better) onto `[0, 1)`.
pub fn bm25_relevance(rank: f64) -> f32 {
    if !rank.is_finite() {
        return 0.0;
    }
    let strength = (-rank).max(0.0);
    (strength / (1.0 + strength)) as f32
}

/// Build an FTS5 MATCH expression: every word quoted, all required.
pub fn build_fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

/// First `max_chars` characters of a chunk, cut on a char boundary.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn into_result(hit: SearchHit, score: f32, snippet_max: usize) -> MemorySearchResult {
    MemorySearchResult {
        source: MemorySource::parse(&hit.source).unwrap_or(MemorySource::Memory),
        snippet: snippet(&hit.text, snippet_max),
        id: hit.id,
        path: hit.path,
        start_line: hit.start_line,
        end_line: hit.end_line,
        score,
        updated_at: hit.updated_at,
    }
}

fn rank(results: &mut [MemorySearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn best(hits: &[SearchHit]) -> f32 {
    hits.iter().map(|h| h.score).fold(0.0, f32::max)
}

/// Merge vector and keyword candidates into one ranked list.
pub fn fuse(
    vector: Vec<SearchHit>,
    keyword: Vec<SearchHit>,
    settings: &QuerySettings,
    limit: usize,
) -> Vec<MemorySearchResult> {
    let (wv, wt) = (settings.vector_weight, settings.text_weight);
    let total = wv + wt;
    let (vmax, tmax) = (best(&vector), best(&keyword));
    let scale = |score: f32, max: f32| {
        if max > 0.0 {
            (score.max(0.0) / max).min(1.0)
        } else {
            0.0
        }
    };

    let mut merged: HashMap<String, (SearchHit, f32, f32)> = HashMap::new();
    for hit in vector {
        let v = scale(hit.score, vmax);
        merged.insert(hit.id.clone(), (hit, v, 0.0));
    }
    for hit in keyword {
        let t = scale(hit.score, tmax);
        merged
            .entry(hit.id.clone())
            .and_modify(|entry| entry.2 = t)
            .or_insert((hit, 0.0, t));
    }

    let mut results: Vec<MemorySearchResult> = merged
        .into_values()
        .map(|(hit, v, t)| {
            let fused = if total > 0.0 {
                (wv * v + wt * t) / total
            } else {
                0.0
            };
            into_result(hit, fused, settings.snippet_max_chars)
        })
        .filter(|r| r.score >= settings.min_score)
        .collect();
    rank(&mut results);
    results.truncate(limit);
    results
}

/// Single-index results keep their native score and order.
fn passthrough(hits: Vec<SearchHit>, settings: &QuerySettings, limit: usize) -> Vec<MemorySearchResult> {
    let mut results: Vec<MemorySearchResult> = hits
        .into_iter()
        .map(|hit| {
            let score = hit.score;
            into_result(hit, score, settings.snippet_max_chars)
        })
        .collect();
    rank(&mut results);
    results.truncate(limit);
    results
}

/// Run `query` against whichever sub-indices are healthy.
///
/// `query_vector` is `None` when no embedding could be produced (no provider,
/// breaker open, embedding call failed); the vector side is skipped then.
pub async fn search_index(
    store: &dyn MemoryStore,
    query: &str,
    query_vector: Option<&[f32]>,
    limit: usize,
    source: Option<MemorySource>,
    settings: &QuerySettings,
) -> Result<(SearchMode, Vec<MemorySearchResult>)> {
    let vector_state = store.vector_availability();
    let fts_state = store.fts_availability();
    let use_vector = vector_state.is_ready() && query_vector.is_some();
    let use_fts = fts_state.is_ready();

    let candidates = limit.saturating_mul(settings.candidate_multiplier.max(1));

    match (use_vector, use_fts) {
        (false, false) => {
            let mut reasons = Vec::new();
            match vector_state.load_error() {
                Some(e) => reasons.push(format!("vector: {e}")),
                None if !vector_state.is_ready() => reasons.push(format!("vector: {vector_state:?}")),
                None => reasons.push("vector: no query embedding available".to_string()),
            }
            match fts_state.load_error() {
                Some(e) => reasons.push(format!("fts: {e}")),
                None => reasons.push(format!("fts: {fts_state:?}")),
            }
            Err(MemoryError::IndexUnavailable(reasons.join("; ")))
        },
        (true, false) => {
            let hits = store
                .vector_search(query_vector.unwrap_or_default(), candidates, source)
                .await?;
            Ok((SearchMode::VectorOnly, passthrough(hits, settings, limit)))
        },
        (false, true) => {
            let hits = match build_fts_query(query) {
                Some(q) => store.keyword_search(&q, candidates, source).await?,
                None => Vec::new(),
            };
            Ok((SearchMode::KeywordOnly, passthrough(hits, settings, limit)))
        },
        (true, true) => {
            let vector = store
                .vector_search(query_vector.unwrap_or_default(), candidates, source)
                .await?;
            let keyword = match build_fts_query(query) {
                Some(q) => store.keyword_search(&q, candidates, source).await?,
                None => Vec::new(),
            };
            debug!(
                vector = vector.len(),
                keyword = keyword.len(),
                "hybrid search candidates"
            );
            Ok((SearchMode::Hybrid, fuse(vector, keyword, settings, limit)))
        },
    }
}
