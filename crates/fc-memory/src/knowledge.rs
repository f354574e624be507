use std::sync::Arc;

use chrono::Utc;

use fc_core::store::{SessionStore, StoreError};
use fc_core::types::Knowledge;

/// Hard cap on the knowledge layer, in tokens.
pub const KNOWLEDGE_BUDGET: usize = 2_000;

// ---------------------------------------------------------------------------
// KnowledgeLayer
// ---------------------------------------------------------------------------

/// Durable key/value facts shared across sessions, bounded to
/// [`KNOWLEDGE_BUDGET`] tokens with importance-ascending eviction.
pub struct KnowledgeLayer {
    store: Arc<SessionStore>,
}

impl KnowledgeLayer {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Add or update a fact, then evict back under the layer budget.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        category: impl Into<String>,
        importance_score: f64,
        token_count: usize,
    ) -> Result<(), StoreError> {
        self.store
            .upsert_knowledge(Knowledge {
                key: key.into(),
                value: value.into(),
                category: category.into(),
                importance_score,
                token_count,
                updated_at: Utc::now(),
            })
            .await?;
        self.store.evict_knowledge_to(KNOWLEDGE_BUDGET).await?;
        Ok(())
    }

    /// All facts, highest importance first, within the layer budget.
    pub async fn load(&self, max_tokens: usize) -> Result<Vec<Knowledge>, StoreError> {
        let all = self.store.query_knowledge(None).await?;
        let mut kept = Vec::new();
        let mut total = 0usize;
        for item in all {
            if total + item.token_count > max_tokens.min(KNOWLEDGE_BUDGET) {
                continue;
            }
            total += item.token_count;
            kept.push(item);
        }
        Ok(kept)
    }

    /// Render the layer as prompt text.
    pub async fn render(&self, max_tokens: usize) -> Result<String, StoreError> {
        let items = self.load(max_tokens).await?;
        Ok(items
            .iter()
            .map(|k| format!("[{}] {}: {}", k.category, k.key, k.value))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn layer() -> KnowledgeLayer {
        KnowledgeLayer::new(Arc::new(SessionStore::in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn put_then_render_contains_fact() {
        let layer = layer().await;
        layer
            .put("indent", "4 spaces, never tabs", "preferences", 0.8, 10)
            .await
            .unwrap();
        let text = layer.render(2_000).await.unwrap();
        assert!(text.contains("indent"));
        assert!(text.contains("4 spaces"));
        assert!(text.contains("[preferences]"));
    }

    #[tokio::test]
    async fn layer_stays_under_budget() {
        let layer = layer().await;
        for i in 0..10 {
            layer
                .put(
                    format!("fact-{i}"),
                    "v",
                    "patterns",
                    i as f64 / 10.0,
                    400,
                )
                .await
                .unwrap();
        }
        let kept = layer.load(KNOWLEDGE_BUDGET).await.unwrap();
        let total: usize = kept.iter().map(|k| k.token_count).sum();
        assert!(total <= KNOWLEDGE_BUDGET);
        // Highest-importance facts survive.
        assert!(kept.iter().any(|k| k.key == "fact-9"));
    }

    #[tokio::test]
    async fn load_respects_caller_cap() {
        let layer = layer().await;
        layer.put("a", "v", "patterns", 0.9, 300).await.unwrap();
        layer.put("b", "v", "patterns", 0.8, 300).await.unwrap();
        let kept = layer.load(350).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key, "a");
    }
}
