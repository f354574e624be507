use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;

use fc_core::types::{Chunk, ChunkType};

/// Results below this cosine similarity are dropped even if K is not reached.
pub const MIN_SIMILARITY: f32 = 0.7;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Retrieval filters applied before scoring.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Glob over the chunk path (`src/**/*.rs`, `*.md`).
    pub path_glob: Option<String>,
    pub chunk_type: Option<ChunkType>,
    /// Only chunks updated within this many days.
    pub max_age_days: Option<f64>,
    /// Files the user is focused on; proximity boosts the composite score.
    pub focus_files: Vec<String>,
}

/// Minimal glob matcher: `*` matches within a path segment, `**` across
/// segments. Enough for path filters without pulling in a full glob engine.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn match_parts(pat: &[&str], path: &[&str]) -> bool {
        match (pat.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                match_parts(&pat[1..], path)
                    || (!path.is_empty() && match_parts(pat, &path[1..]))
            }
            (Some(p), Some(s)) => match_segment(p, s) && match_parts(&pat[1..], &path[1..]),
            _ => false,
        }
    }

    fn match_segment(pat: &str, seg: &str) -> bool {
        // Wildcard-aware segment match over bytes.
        let (pat, seg) = (pat.as_bytes(), seg.as_bytes());
        let (mut pi, mut si) = (0usize, 0usize);
        let (mut star, mut backtrack) = (None, 0usize);
        while si < seg.len() {
            if pi < pat.len() && (pat[pi] == b'?' || pat[pi] == seg[si]) {
                pi += 1;
                si += 1;
            } else if pi < pat.len() && pat[pi] == b'*' {
                star = Some(pi);
                backtrack = si;
                pi += 1;
            } else if let Some(sp) = star {
                pi = sp + 1;
                backtrack += 1;
                si = backtrack;
            } else {
                return false;
            }
        }
        while pi < pat.len() && pat[pi] == b'*' {
            pi += 1;
        }
        pi == pat.len()
    }

    let pat_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();
    match_parts(&pat_parts, &path_parts)
}

// ---------------------------------------------------------------------------
// SearchHit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: Chunk,
    pub similarity: f32,
    pub score: f32,
    /// True when the store fell back to keyword search.
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// VectorStore
// ---------------------------------------------------------------------------

/// In-memory cosine index over a project's chunks.
///
/// Chunks are deduplicated on `(path, content_hash, line_span)`. Scoring is
/// `similarity + 0.3·focus_proximity + 0.2·exp(-age_days/7)` with ties broken
/// by similarity, recency, then path.
#[derive(Default)]
pub struct VectorStore {
    chunks: Vec<Chunk>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        let mut store = Self::new();
        for chunk in chunks {
            store.store(chunk);
        }
        store
    }

    /// Insert a chunk, replacing any existing entry with the same dedupe key.
    pub fn store(&mut self, chunk: Chunk) {
        let key = chunk.dedupe_key();
        if let Some(existing) = self.chunks.iter_mut().find(|c| c.dedupe_key() == key) {
            *existing = chunk;
        } else {
            self.chunks.push(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn passes(&self, chunk: &Chunk, filters: &SearchFilters) -> bool {
        if let Some(ref glob) = filters.path_glob {
            if !glob_match(glob, &chunk.path) {
                return false;
            }
        }
        if let Some(ct) = filters.chunk_type {
            if chunk.chunk_type != ct {
                return false;
            }
        }
        if let Some(max_age) = filters.max_age_days {
            if age_days(chunk) > max_age {
                return false;
            }
        }
        true
    }

    /// Cosine retrieval over unit-normalized vectors.
    pub fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .chunks
            .iter()
            .filter(|c| self.passes(c, filters))
            .filter_map(|chunk| {
                let similarity = cosine(query, &chunk.embedding);
                if similarity < MIN_SIMILARITY {
                    return None;
                }
                let proximity = focus_proximity(&chunk.path, &filters.focus_files);
                let recency = (-age_days(chunk) / 7.0).exp() as f32;
                Some(SearchHit {
                    similarity,
                    score: similarity + 0.3 * proximity + 0.2 * recency,
                    chunk: chunk.clone(),
                    degraded: false,
                })
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(k);
        dedupe_hits(hits)
    }

    /// Degraded keyword retrieval (token-set overlap) for when the embedding
    /// provider is unavailable. Hits are flagged `degraded=true`.
    pub fn keyword_search(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Vec<SearchHit> {
        let query_tokens = token_set(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .chunks
            .iter()
            .filter(|c| self.passes(c, filters))
            .filter_map(|chunk| {
                let chunk_tokens = token_set(&chunk.content);
                let overlap = query_tokens.intersection(&chunk_tokens).count();
                if overlap == 0 {
                    return None;
                }
                let similarity = overlap as f32 / query_tokens.len() as f32;
                let proximity = focus_proximity(&chunk.path, &filters.focus_files);
                let recency = (-age_days(chunk) / 7.0).exp() as f32;
                Some(SearchHit {
                    similarity,
                    score: similarity + 0.3 * proximity + 0.2 * recency,
                    chunk: chunk.clone(),
                    degraded: true,
                })
            })
            .collect();

        debug!(hits = hits.len(), "keyword search (degraded mode)");
        sort_hits(&mut hits);
        hits.truncate(k);
        dedupe_hits(hits)
    }
}

// ---------------------------------------------------------------------------
// Scoring helpers
// ---------------------------------------------------------------------------

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    // Vectors are stored unit-normalized, so the dot product is the cosine.
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn age_days(chunk: &Chunk) -> f64 {
    let age = Utc::now() - chunk.updated_at;
    (age.num_seconds().max(0) as f64) / 86_400.0
}

fn focus_proximity(path: &str, focus_files: &[String]) -> f32 {
    if focus_files.is_empty() {
        return 0.0;
    }
    if focus_files.iter().any(|f| f == path) {
        return 1.0;
    }
    let dir = path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    if focus_files
        .iter()
        .any(|f| f.rsplit_once('/').map(|(d, _)| d).unwrap_or("") == dir)
    {
        return 0.5;
    }
    0.0
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.chunk.updated_at.cmp(&a.chunk.updated_at))
            .then(a.chunk.path.cmp(&b.chunk.path))
    });
}

fn dedupe_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.chunk.dedupe_key()))
        .collect()
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
