//! Layered memory for the flexicli runtime.
//!
//! Four semantically distinct layers compose into every prompt: ephemeral
//! conversation turns, retrieved chunks, durable knowledge, and git context.
//! The embedding cache and cosine vector store live here too.

pub mod embedding;
pub mod ephemeral;
pub mod git_context;
pub mod indexer;
pub mod knowledge;
pub mod layers;
pub mod vector;

pub use embedding::{CachedEmbedder, EmbeddingError, EmbeddingProvider, MockEmbedder};
pub use layers::{MemoryError, MemoryLayers, PromptParts};
pub use vector::{SearchFilters, SearchHit, VectorStore};
