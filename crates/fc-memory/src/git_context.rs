use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use fc_core::budget::TokenCounter;
use fc_core::store::{SessionStore, StoreError};
use fc_core::types::GitCommitRecord;

/// Default cap on commits ingested per project.
pub const MAX_COMMITS: usize = 200;

/// Per-file cap on rendered git context, in tokens.
pub const MAX_TOKENS_PER_FILE: usize = 500;

/// Lines of commit message kept around the subject for context.
const MESSAGE_CONTEXT_LINES: usize = 3;

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Ingest the repository history under `root` into the store, oldest-first,
/// capped at `max_commits`.
///
/// The absence of a `.git/` directory is not an error; the function returns
/// zero. Records the store rejects (invalid hashes) are skipped without
/// aborting the rest of the ingestion.
pub async fn ingest_history(
    root: &Path,
    project_id: &str,
    store: &SessionStore,
    max_commits: usize,
) -> Result<usize, StoreError> {
    let records = match collect_commits(root, project_id, max_commits) {
        Ok(records) => records,
        Err(e) => {
            debug!(error = %e, "no usable git history");
            return Ok(0);
        }
    };

    let mut ingested = 0usize;
    for record in records {
        match store.insert_commit(record).await {
            Ok(()) => ingested += 1,
            Err(StoreError::InvalidCommitHash(hash)) => {
                warn!(hash, "skipping commit with invalid hash");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(ingested)
}

/// Walk the repo newest-first, then reverse so ingestion is oldest-first.
fn collect_commits(
    root: &Path,
    project_id: &str,
    max_commits: usize,
) -> Result<Vec<GitCommitRecord>, git2::Error> {
    let repo = git2::Repository::open(root)?;
    let mut walk = repo.revwalk()?;
    walk.push_head()?;

    let mut records = Vec::new();
    for oid in walk.take(max_commits) {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;

        let date: DateTime<Utc> = DateTime::from_timestamp(commit.time().seconds(), 0)
            .unwrap_or_else(Utc::now);
        let author = commit
            .author()
            .name()
            .unwrap_or("unknown")
            .to_string();
        let message = commit.message().unwrap_or("").trim().to_string();
        let diff_summary = summarize_diff(&repo, &commit);

        records.push(GitCommitRecord {
            project_id: project_id.to_string(),
            hash: oid.to_string(),
            author,
            date,
            message,
            diff_summary,
        });
    }
    records.reverse();
    Ok(records)
}

fn summarize_diff(repo: &git2::Repository, commit: &git2::Commit<'_>) -> String {
    let tree = match commit.tree() {
        Ok(t) => t,
        Err(_) => return String::new(),
    };
    let parent_tree = commit.parent(0).ok().and_then(|p| p.tree().ok());

    let diff = match repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None) {
        Ok(d) => d,
        Err(_) => return String::new(),
    };

    let mut paths: Vec<String> = Vec::new();
    for delta in diff.deltas() {
        if let Some(path) = delta.new_file().path().and_then(|p| p.to_str()) {
            paths.push(path.to_string());
        }
    }

    match diff.stats() {
        Ok(stats) => format!(
            "{} files changed, +{} -{}: {}",
            stats.files_changed(),
            stats.insertions(),
            stats.deletions(),
            paths.join(", "),
        ),
        Err(_) => paths.join(", "),
    }
}

// ---------------------------------------------------------------------------
// Query-side rendering
// ---------------------------------------------------------------------------

/// Extract path-like tokens from a user query (`src/main.rs`, `config.toml`).
pub fn extract_paths(query: &str) -> Vec<String> {
    query
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';' || c == '"' || c == '\'')
        .filter(|t| {
            let t = t.trim_matches(|c: char| c == '(' || c == ')' || c == '.');
            !t.is_empty() && (t.contains('/') || looks_like_filename(t))
        })
        .map(|t| {
            t.trim_matches(|c: char| c == '(' || c == ')')
                .trim_end_matches(['.', ':'])
                .to_string()
        })
        .collect()
}

fn looks_like_filename(token: &str) -> bool {
    match token.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=6).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Build the git context layer for a query: commits touching files the query
/// names, oldest first, capped per file at [`MAX_TOKENS_PER_FILE`].
pub async fn build_context(
    store: &SessionStore,
    query: &str,
    counter: &TokenCounter,
) -> Result<String, StoreError> {
    let paths = extract_paths(query);
    if paths.is_empty() {
        return Ok(String::new());
    }

    let commits = store.commits_for_paths(paths.clone()).await?;
    if commits.is_empty() {
        return Ok(String::new());
    }

    let mut sections = Vec::new();
    for path in &paths {
        let relevant: Vec<&GitCommitRecord> = commits
            .iter()
            .filter(|c| c.message.contains(path.as_str()) || c.diff_summary.contains(path.as_str()))
            .collect();
        if relevant.is_empty() {
            continue;
        }

        let mut body = format!("## {path}\n");
        for commit in relevant {
            let subject: String = commit
                .message
                .lines()
                .take(MESSAGE_CONTEXT_LINES)
                .collect::<Vec<_>>()
                .join(" | ");
            body.push_str(&format!(
                "- {} {} ({})\n",
                &commit.hash[..8.min(commit.hash.len())],
                subject,
                commit.diff_summary,
            ));
        }
        sections.push(counter.trim_to_fit(&body, MAX_TOKENS_PER_FILE));
    }

    Ok(sections.join("\n"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
