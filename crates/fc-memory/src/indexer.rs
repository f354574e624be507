use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fc_core::budget::TokenCounter;
use fc_core::store::SessionStore;
use fc_core::types::{Chunk, ChunkType};

use crate::embedding::EmbeddingProvider;
use crate::layers::Result;

/// Token bounds per chunk type. Fragments below the minimum are skipped.
pub const CODE_TOKEN_BOUNDS: (usize, usize) = (100, 800);
pub const DOC_TOKEN_BOUNDS: (usize, usize) = (50, 800);

/// Files larger than this are not indexed.
const MAX_FILE_BYTES: u64 = 512 * 1024;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "c", "h", "cpp", "hpp", "rb", "sh",
    "toml", "yaml", "yml", "json", "sql",
];
const DOC_EXTENSIONS: &[&str] = &["md", "txt", "rst", "adoc"];

const SKIP_DIRS: &[&str] = &[".git", ".flexicli", "target", "node_modules", "dist", ".venv"];

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// A chunk of file content before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub content: String,
    pub line_start: u32,
    pub line_end: u32,
    pub token_count: usize,
}

/// Split file content into line-aligned pieces within the token bounds for
/// its chunk type. A trailing fragment below the minimum is dropped; a file
/// smaller than the minimum yields nothing.
pub fn chunk_content(content: &str, chunk_type: ChunkType, counter: &TokenCounter) -> Vec<ChunkPiece> {
    let (min_tokens, max_tokens) = match chunk_type {
        ChunkType::Doc => DOC_TOKEN_BOUNDS,
        _ => CODE_TOKEN_BOUNDS,
    };

    let mut pieces: Vec<ChunkPiece> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;
    let mut start_line = 1u32;
    let mut line_no = 0u32;

    for line in content.lines() {
        line_no += 1;
        let line_tokens = counter.count(line) + 1;
        // A single line past the maximum (minified output, embedded data)
        // can never form a valid chunk; flush what came before and skip it.
        if line_tokens > max_tokens {
            if current_tokens >= min_tokens {
                pieces.push(ChunkPiece {
                    content: std::mem::take(&mut current),
                    line_start: start_line,
                    line_end: line_no - 1,
                    token_count: current_tokens,
                });
            } else {
                current.clear();
            }
            current_tokens = 0;
            start_line = line_no + 1;
            continue;
        }
        if current_tokens + line_tokens > max_tokens && current_tokens >= min_tokens {
            pieces.push(ChunkPiece {
                content: std::mem::take(&mut current),
                line_start: start_line,
                line_end: line_no - 1,
                token_count: current_tokens,
            });
            current_tokens = 0;
            start_line = line_no;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        current_tokens += line_tokens;
    }

    if current_tokens >= min_tokens {
        pieces.push(ChunkPiece {
            content: current,
            line_start: start_line,
            line_end: line_no,
            token_count: current_tokens,
        });
    }
    pieces
}

fn classify_extension(path: &Path) -> Option<ChunkType> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if CODE_EXTENSIONS.contains(&ext.as_str()) {
        Some(ChunkType::Code)
    } else if DOC_EXTENSIONS.contains(&ext.as_str()) {
        Some(ChunkType::Doc)
    } else {
        None
    }
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))[..16].to_string()
}

// ---------------------------------------------------------------------------
// Project indexing
// ---------------------------------------------------------------------------

/// Walk the project tree, chunk every indexable file, embed each chunk, and
/// upsert the results into the store. Returns the number of chunks written.
///
/// Without an embedder the chunks are stored with empty vectors; retrieval
/// then runs in degraded keyword mode against the same content.
pub async fn index_project(
    root: &Path,
    project_id: &str,
    store: &SessionStore,
    embedder: Option<&dyn EmbeddingProvider>,
    counter: &TokenCounter,
) -> Result<usize> {
    let files = collect_files(root);
    let mut written = 0usize;

    for path in files {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Some(chunk_type) = classify_extension(&path) else {
            continue;
        };
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        for piece in chunk_content(&content, chunk_type, counter) {
            let embedding = match embedder {
                Some(embedder) => match embedder.embed(&piece.content).await {
                    Ok(vector) => vector,
                    Err(e) => {
                        warn!(path = %rel, error = %e, "embedding failed, storing without vector");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            store
                .upsert_chunk(Chunk {
                    project_id: project_id.to_string(),
                    path: rel.clone(),
                    content_hash: content_hash(&piece.content),
                    content: piece.content,
                    chunk_type,
                    token_count: piece.token_count,
                    embedding,
                    line_start: piece.line_start,
                    line_end: piece.line_end,
                    updated_at: Utc::now(),
                })
                .await?;
            written += 1;
        }
    }

    info!(chunks = written, "project indexed");
    Ok(written)
}

fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            if SKIP_DIRS.iter().any(|d| name == *d) {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if entry.metadata().map(|m| m.len() <= MAX_FILE_BYTES).unwrap_or(false) {
                out.push(path);
            }
        }
    }
    out.sort();
    debug!(files = out.len(), "collected indexable files");
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;

    fn counter() -> TokenCounter {
        TokenCounter::heuristic()
    }

    fn lines(n: usize, width: usize) -> String {
        (0..n)
            .map(|i| format!("{i:>width$}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn chunks_stay_within_code_bounds() {
        // ~40 tokens per line forces several chunks out of 100 lines.
        let content = lines(100, 160);
        let pieces = chunk_content(&content, ChunkType::Code, &counter());
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.token_count >= CODE_TOKEN_BOUNDS.0, "{}", piece.token_count);
            assert!(piece.token_count <= CODE_TOKEN_BOUNDS.1, "{}", piece.token_count);
        }
    }

    #[test]
    fn line_spans_are_contiguous() {
        let content = lines(100, 160);
        let pieces = chunk_content(&content, ChunkType::Code, &counter());
        assert_eq!(pieces[0].line_start, 1);
        for pair in pieces.windows(2) {
            assert_eq!(pair[1].line_start, pair[0].line_end + 1);
        }
        assert_eq!(pieces.last().unwrap().line_end, 100);
    }

    #[test]
    fn tiny_file_yields_nothing() {
        let pieces = chunk_content("fn main() {}\n", ChunkType::Code, &counter());
        assert!(pieces.is_empty());
    }

    #[test]
    fn doc_minimum_is_lower_than_code() {
        // ~60 tokens: below the code minimum, above the doc minimum.
        let content = lines(10, 24);
        assert!(chunk_content(&content, ChunkType::Code, &counter()).is_empty());
        let docs = chunk_content(&content, ChunkType::Doc, &counter());
        assert_eq!(docs.len(), 1);
        assert!(docs[0].token_count >= DOC_TOKEN_BOUNDS.0);
    }

    #[test]
    fn sub_minimum_tail_is_dropped() {
        // Line 20 overflows the first chunk and starts a tail that stays
        // below the code minimum, so only the full chunk survives.
        let content = lines(20, 160);
        let pieces = chunk_content(&content, ChunkType::Code, &counter());
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].line_end, 19);
        assert!(pieces[0].token_count >= CODE_TOKEN_BOUNDS.0);
    }

    #[test]
    fn oversized_single_line_is_skipped() {
        let blob = "x".repeat(4_000);
        let content = format!("{}\n{}\n{}", lines(30, 160), blob, lines(30, 160));
        let pieces = chunk_content(&content, ChunkType::Code, &counter());
        assert!(!pieces.is_empty());
        for piece in &pieces {
            assert!(piece.token_count <= CODE_TOKEN_BOUNDS.1);
            assert!(!piece.content.contains(&blob));
        }
    }

    #[test]
    fn extension_classification() {
        assert_eq!(classify_extension(Path::new("src/main.rs")), Some(ChunkType::Code));
        assert_eq!(classify_extension(Path::new("README.md")), Some(ChunkType::Doc));
        assert_eq!(classify_extension(Path::new("image.png")), None);
        assert_eq!(classify_extension(Path::new("Makefile")), None);
    }

    #[tokio::test]
    async fn index_project_writes_chunks_and_skips_state_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/big.rs"), lines(100, 160)).unwrap();
        std::fs::write(dir.path().join(".git/config.rs"), lines(100, 160)).unwrap();

        let store = SessionStore::in_memory().await.unwrap();
        let embedder = MockEmbedder::with_dim(16);
        let n = index_project(dir.path(), "p", &store, Some(&embedder), &counter())
            .await
            .unwrap();
        assert!(n > 1);

        let chunks = store.chunks_for_project("p").await.unwrap();
        assert_eq!(chunks.len(), n);
        assert!(chunks.iter().all(|c| c.path.starts_with("src/")));
        assert!(chunks.iter().all(|c| !c.embedding.is_empty()));
        assert!(chunks.iter().all(|c| c.content_hash.len() == 16));
    }

    #[tokio::test]
    async fn reindex_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code.rs"), lines(100, 160)).unwrap();

        let store = SessionStore::in_memory().await.unwrap();
        let first = index_project(dir.path(), "p", &store, None, &counter())
            .await
            .unwrap();
        let second = index_project(dir.path(), "p", &store, None, &counter())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.chunk_count().await.unwrap(), first);
    }
}
