use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use fc_core::config::EmbeddingConfig;
use fc_core::error::{ErrorKind, Kinded};

/// Dimension of stored embedding vectors.
pub const EMBEDDING_DIM: usize = 1536;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("embedding API error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("embeddings are not configured")]
    NotConfigured,
    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),
}

impl Kinded for EmbeddingError {
    fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::Http(_) | EmbeddingError::Api { .. } => ErrorKind::TransientIo,
            EmbeddingError::Parse(_) => ErrorKind::Tool,
            EmbeddingError::NotConfigured => ErrorKind::Validation,
            EmbeddingError::Cache(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(err: reqwest::Error) -> Self {
        EmbeddingError::Http(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ---------------------------------------------------------------------------
// EmbeddingProvider trait
// ---------------------------------------------------------------------------

/// Async trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a text into a unit-normalized vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Normalize a vector in place to unit length. Zero vectors are untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// HttpEmbedder
// ---------------------------------------------------------------------------

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    api_version: Option<String>,
}

impl HttpEmbedder {
    /// Build from config. Returns `None` when no endpoint is configured,
    /// which puts the vector store into degraded keyword mode.
    pub fn from_config(cfg: &EmbeddingConfig) -> Option<Self> {
        let endpoint = cfg.endpoint.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg
                .model_name
                .clone()
                .or_else(|| cfg.deployment.clone())
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            api_version: cfg.api_version.clone(),
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut url = self.endpoint.clone();
        if let Some(ref version) = self.api_version {
            url = format!("{url}?api-version={version}");
        }

        let mut req = self.client.post(&url).json(&serde_json::json!({
            "input": text,
            "model": self.model,
        }));
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EmbeddingError::Api { status, message });
        }

        let body: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Parse(e.to_string()))?;
        let mut vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Parse("empty embedding response".into()))?;
        normalize(&mut vector);
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// MockEmbedder
// ---------------------------------------------------------------------------

/// Deterministic embedder for tests: hashes the input into a fixed-dimension
/// unit vector, so `embed(x) == embed(x)` always holds.
pub struct MockEmbedder {
    dim: usize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self { dim: EMBEDDING_DIM }
    }

    pub fn with_dim(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dim];
        // Spread token hashes over the vector so similar texts overlap.
        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            vector[idx] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// CachedEmbedder
// ---------------------------------------------------------------------------

/// SHA-256-keyed file cache in front of any provider.
///
/// A hit returns without touching the inner provider; files live in the
/// project's `cache/` directory, one per input hash.
pub struct CachedEmbedder<P> {
    inner: P,
    dir: PathBuf,
}

impl<P: EmbeddingProvider> CachedEmbedder<P> {
    pub fn new(inner: P, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: cache_dir.into(),
        }
    }

    fn cache_path(&self, text: &str) -> PathBuf {
        let digest = Sha256::digest(text.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for CachedEmbedder<P> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let path = self.cache_path(text);

        if let Ok(data) = tokio::fs::read_to_string(&path).await {
            match serde_json::from_str::<Vec<f32>>(&data) {
                Ok(vector) => {
                    debug!(path = %path.display(), "embedding cache hit");
                    return Ok(vector);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt cache entry, refetching");
                }
            }
        }

        let vector = self.inner.embed(text).await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, serde_json::to_string(&vector).expect("serialize vector"))
            .await?;
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
