use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fc_core::budget::{BudgetCategory, BudgetError, TokenBudgetManager};
use fc_core::error::{ErrorKind, Kinded};
use fc_core::store::{SessionStore, StoreError};

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::ephemeral::{EphemeralMemory, EphemeralState};
use crate::git_context;
use crate::knowledge::KnowledgeLayer;
use crate::vector::{SearchFilters, SearchHit, VectorStore};

/// Retrieval starts at this K...
pub const RETRIEVAL_K_INITIAL: usize = 12;
/// ...and expands to at most this while the retrieved budget allows.
pub const RETRIEVAL_K_MAX: usize = 30;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

impl Kinded for MemoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Budget(e) => e.kind(),
            MemoryError::Store(e) => e.kind(),
            MemoryError::Embedding(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// PromptParts
// ---------------------------------------------------------------------------

/// The assembled prompt, one field per layer. Every field is within its
/// layer budget and the total is within the hard input ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptParts {
    pub system: String,
    pub ephemeral: String,
    pub retrieved: String,
    pub knowledge: String,
    pub git: String,
    pub user: String,
    /// Dedupe keys of the retrieved chunks, for snapshots.
    pub retrieval_ids: Vec<String>,
    /// True when retrieval ran in degraded keyword mode.
    pub degraded_retrieval: bool,
}

impl PromptParts {
    /// Collapse the context layers into one block for providers that take a
    /// single system string.
    pub fn context_block(&self) -> String {
        let mut sections = Vec::new();
        if !self.knowledge.is_empty() {
            sections.push(format!("# Project knowledge\n{}", self.knowledge));
        }
        if !self.retrieved.is_empty() {
            sections.push(format!("# Relevant code\n{}", self.retrieved));
        }
        if !self.git.is_empty() {
            sections.push(format!("# Recent history\n{}", self.git));
        }
        if !self.ephemeral.is_empty() {
            sections.push(format!("# Conversation\n{}", self.ephemeral));
        }
        sections.join("\n\n")
    }
}

// ---------------------------------------------------------------------------
// MemoryLayers
// ---------------------------------------------------------------------------

/// Composes the four memory layers into bounded prompts.
pub struct MemoryLayers {
    store: Arc<SessionStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    vector: VectorStore,
    ephemeral: EphemeralMemory,
    knowledge: KnowledgeLayer,
}

impl MemoryLayers {
    pub fn new(
        store: Arc<SessionStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        ephemeral: EphemeralMemory,
    ) -> Self {
        Self {
            knowledge: KnowledgeLayer::new(Arc::clone(&store)),
            store,
            embedder,
            vector: VectorStore::new(),
            ephemeral,
        }
    }

    /// Load the vector index from the project's stored chunks.
    pub async fn load_index(&mut self, project_id: &str) -> Result<usize> {
        let chunks = self.store.chunks_for_project(project_id).await?;
        let n = chunks.len();
        self.vector = VectorStore::from_chunks(chunks);
        Ok(n)
    }

    pub fn vector_mut(&mut self) -> &mut VectorStore {
        &mut self.vector
    }

    pub fn knowledge(&self) -> &KnowledgeLayer {
        &self.knowledge
    }

    /// Record a conversation turn into ephemeral memory.
    pub fn record_turn(&mut self, role: &str, content: &str, tokens: usize) {
        self.ephemeral.push(role, content, tokens);
    }

    pub fn ephemeral_state(&mut self) -> EphemeralState {
        self.ephemeral.state()
    }

    pub fn restore_ephemeral(&mut self, state: EphemeralState) {
        self.ephemeral.restore(state);
    }

    pub fn clear_ephemeral(&mut self) {
        self.ephemeral.clear();
    }

    /// Assemble a prompt for `query` under the manager's mode budgets.
    ///
    /// Guarantees: every layer is within its budget; the total input is
    /// within the hard ceiling; retrieval expansion stops when the next
    /// chunk would overflow; the result is deterministic for fixed inputs
    /// and retrieval results. Fails with a budget error, before any
    /// provider call, when the query itself cannot fit.
    pub async fn build_prompt(
        &mut self,
        system_prompt: &str,
        query: &str,
        budget: &mut TokenBudgetManager,
        filters: &SearchFilters,
    ) -> Result<PromptParts> {
        // Query is a mandatory category: over-limit fails loudly.
        let query_tokens = budget.count(query);
        budget.record(BudgetCategory::Query, query_tokens)?;

        // Safety/system layer.
        let system = budget.trim_to_fit(BudgetCategory::Safety, system_prompt);
        budget.record(BudgetCategory::Safety, budget.count(&system))?;

        // Ephemeral layer.
        let ephemeral_text = self.ephemeral.render();
        let ephemeral = budget.trim_to_fit(BudgetCategory::Ephemeral, &ephemeral_text);
        budget.record(BudgetCategory::Ephemeral, budget.count(&ephemeral))?;

        // Retrieved layer: K starts at RETRIEVAL_K_INITIAL and expands to
        // RETRIEVAL_K_MAX while the budget allows.
        let (hits, degraded) = self.retrieve(query, filters).await;
        let mut retrieved_sections = Vec::new();
        let mut retrieval_ids = Vec::new();
        let mut retrieved_tokens = 0usize;
        let mut k = RETRIEVAL_K_INITIAL;
        let mut index = 0;
        while index < hits.len() && index < k {
            let hit = &hits[index];
            let section = format!(
                "--- {} (lines {}-{})\n{}",
                hit.chunk.path, hit.chunk.line_start, hit.chunk.line_end, hit.chunk.content,
            );
            let section_tokens = budget.count(&section);
            if retrieved_tokens + section_tokens > budget.remaining(BudgetCategory::Retrieved) {
                // The next chunk would overflow; expansion stops here.
                break;
            }
            retrieved_tokens += section_tokens;
            retrieved_sections.push(section);
            retrieval_ids.push(format!(
                "{}@{}-{}#{}",
                hit.chunk.path, hit.chunk.line_start, hit.chunk.line_end, hit.chunk.content_hash,
            ));
            index += 1;
            // The whole initial batch fit, so widen toward the maximum.
            if index == k && k < RETRIEVAL_K_MAX {
                k = RETRIEVAL_K_MAX;
            }
        }
        let retrieved = retrieved_sections.join("\n");
        budget.record(BudgetCategory::Retrieved, retrieved_tokens)?;

        // Knowledge layer.
        let knowledge = self
            .knowledge
            .render(budget.remaining(BudgetCategory::Knowledge))
            .await?;
        budget.record(BudgetCategory::Knowledge, budget.count(&knowledge))?;

        // Git context rides in the working buffer allocation.
        let git_text = git_context::build_context(&self.store, query, budget.counter()).await?;
        let git = budget.trim_to_fit(BudgetCategory::Buffer, &git_text);
        budget.record(BudgetCategory::Buffer, budget.count(&git))?;

        debug!(
            query_tokens,
            retrieved_chunks = retrieval_ids.len(),
            degraded,
            input_used = budget.input_used(),
            "prompt assembled"
        );

        Ok(PromptParts {
            system,
            ephemeral,
            retrieved,
            knowledge,
            git,
            user: query.to_string(),
            retrieval_ids,
            degraded_retrieval: degraded,
        })
    }

    async fn retrieve(&self, query: &str, filters: &SearchFilters) -> (Vec<SearchHit>, bool) {
        if let Some(ref embedder) = self.embedder {
            match embedder.embed(query).await {
                Ok(vector) => {
                    let hits = self.vector.search_top_k(&vector, RETRIEVAL_K_MAX, filters);
                    return (hits, false);
                }
                Err(e) => {
                    warn!(error = %e, "embedding failed, degrading to keyword search");
                }
            }
        }
        let hits = self.vector.keyword_search(query, RETRIEVAL_K_MAX, filters);
        (hits, true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use fc_core::budget::{TokenCounter, INPUT_CEILING};
    use fc_core::types::{Chunk, ChunkType, Mode};

    use crate::embedding::MockEmbedder;

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Http("connection refused".into()))
        }
    }

    fn budget() -> TokenBudgetManager {
        TokenBudgetManager::with_counter(Mode::Concise, TokenCounter::heuristic())
    }

    async fn layers_with(
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> (MemoryLayers, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::in_memory().await.unwrap());
        let layers = MemoryLayers::new(
            Arc::clone(&store),
            embedder,
            EphemeralMemory::new(5_000, 1 << 20),
        );
        (layers, store)
    }

    fn code_chunk(path: &str, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            project_id: "p".into(),
            path: path.into(),
            content: content.into(),
            chunk_type: ChunkType::Code,
            token_count: content.len().div_ceil(4),
            embedding,
            line_start: 1,
            line_end: 30,
            content_hash: path.replace('/', "_"),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn build_prompt_respects_all_budgets() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::with_dim(64));
        let (mut layers, _store) = layers_with(Some(Arc::clone(&embedder))).await;

        let query_vec = embedder.embed("parse config file").await.unwrap();
        layers
            .vector_mut()
            .store(code_chunk("src/config.rs", "parse config file logic", query_vec.clone()));

        layers.record_turn("user", "earlier question", 4);
        layers.record_turn("assistant", "earlier answer", 4);

        let mut budget = budget();
        let parts = layers
            .build_prompt(
                "You are a coding assistant.",
                "parse config file",
                &mut budget,
                &SearchFilters::default(),
            )
            .await
            .unwrap();

        assert_eq!(parts.user, "parse config file");
        assert!(parts.ephemeral.contains("earlier question"));
        assert!(!parts.degraded_retrieval);
        let report = budget.report();
        assert!(report.input_used <= INPUT_CEILING);
        for cat in &report.categories {
            assert!(cat.used <= cat.cap, "{:?} over budget", cat.category);
        }
    }

    #[tokio::test]
    async fn oversized_query_fails_before_any_provider_call() {
        let (mut layers, _store) = layers_with(None).await;
        let mut budget = budget();
        // Concise query cap is 2000 tokens = 8000 chars heuristic.
        let huge_query = "x".repeat(50_000);
        let err = layers
            .build_prompt("sys", &huge_query, &mut budget, &SearchFilters::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Budget);
    }

    #[tokio::test]
    async fn retrieval_expansion_stops_at_budget() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::with_dim(64));
        let (mut layers, _store) = layers_with(Some(Arc::clone(&embedder))).await;

        let vec = embedder.embed("find the handler").await.unwrap();
        // Forty fat chunks; the retrieved budget cannot hold them all.
        for i in 0..40 {
            layers.vector_mut().store(code_chunk(
                &format!("src/h{i}.rs"),
                &"handler body ".repeat(2_000),
                vec.clone(),
            ));
        }

        let mut budget = budget();
        let parts = layers
            .build_prompt("sys", "find the handler", &mut budget, &SearchFilters::default())
            .await
            .unwrap();

        assert!(parts.retrieval_ids.len() <= RETRIEVAL_K_MAX);
        assert!(budget.used(BudgetCategory::Retrieved) <= 40_000);
    }

    #[tokio::test]
    async fn retrieval_ids_are_unique() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::with_dim(64));
        let (mut layers, _store) = layers_with(Some(Arc::clone(&embedder))).await;
        let vec = embedder.embed("dup").await.unwrap();
        layers.vector_mut().store(code_chunk("a.rs", "dup", vec.clone()));
        layers.vector_mut().store(code_chunk("a.rs", "dup", vec));

        let mut budget = budget();
        let parts = layers
            .build_prompt("sys", "dup", &mut budget, &SearchFilters::default())
            .await
            .unwrap();
        let mut ids = parts.retrieval_ids.clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), parts.retrieval_ids.len());
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_keywords() {
        let (mut layers, _store) = layers_with(Some(Arc::new(FailingEmbedder))).await;
        layers.vector_mut().store(code_chunk(
            "src/auth.rs",
            "authentication token validation",
            vec![0.0; 4],
        ));

        let mut budget = budget();
        let parts = layers
            .build_prompt(
                "sys",
                "where is authentication validation",
                &mut budget,
                &SearchFilters::default(),
            )
            .await
            .unwrap();
        assert!(parts.degraded_retrieval);
        assert!(parts.retrieved.contains("src/auth.rs"));
    }

    #[tokio::test]
    async fn deterministic_for_same_inputs() {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(MockEmbedder::with_dim(64));
        let (mut layers, _store) = layers_with(Some(Arc::clone(&embedder))).await;
        let vec = embedder.embed("stable query").await.unwrap();
        layers.vector_mut().store(code_chunk("s.rs", "stable query impl", vec));

        let mut b1 = budget();
        let p1 = layers
            .build_prompt("sys", "stable query", &mut b1, &SearchFilters::default())
            .await
            .unwrap();
        let mut b2 = budget();
        let p2 = layers
            .build_prompt("sys", "stable query", &mut b2, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(p1.retrieved, p2.retrieved);
        assert_eq!(p1.retrieval_ids, p2.retrieval_ids);
        assert_eq!(p1.system, p2.system);
    }
}
