use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Checkpoint cadence: every N recorded operations.
pub const CHECKPOINT_EVERY: u64 = 3;

/// Turns older than this are dropped on access.
pub const TURN_TTL: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One conversation turn held in ephemeral memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
    pub tokens: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Serialized form of the layer, embedded in session snapshots and
/// checkpoint files.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EphemeralState {
    pub turns: Vec<ConversationTurn>,
    pub ops_count: u64,
}

// ---------------------------------------------------------------------------
// EphemeralMemory
// ---------------------------------------------------------------------------

/// LRU-bounded conversation memory with byte, token, and TTL caps.
///
/// Checkpointed to the session directory every [`CHECKPOINT_EVERY`] ops so a
/// crashed session can resume with its recent turns intact.
pub struct EphemeralMemory {
    turns: LruCache<u64, ConversationTurn>,
    next_seq: u64,
    ops_count: u64,
    max_tokens: usize,
    max_bytes: usize,
    ttl: Duration,
    checkpoint_path: Option<PathBuf>,
}

impl EphemeralMemory {
    pub fn new(max_tokens: usize, max_bytes: usize) -> Self {
        Self {
            turns: LruCache::new(NonZeroUsize::new(256).expect("256 is non-zero")),
            next_seq: 0,
            ops_count: 0,
            max_tokens,
            max_bytes,
            ttl: TURN_TTL,
            checkpoint_path: None,
        }
    }

    /// Enable periodic checkpoints into the given session directory.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(dir.into().join("ephemeral.json"));
        self
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Record a turn. Evicts least-recently-used turns until the byte and
    /// token caps hold, then checkpoints on the op cadence.
    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>, tokens: usize) {
        let turn = ConversationTurn {
            role: role.into(),
            content: content.into(),
            tokens,
            recorded_at: Utc::now(),
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.turns.put(seq, turn);
        self.enforce_caps();

        self.ops_count += 1;
        if self.ops_count % CHECKPOINT_EVERY == 0 {
            self.checkpoint();
        }
    }

    fn enforce_caps(&mut self) {
        self.expire();
        loop {
            let tokens: usize = self.turns.iter().map(|(_, t)| t.tokens).sum();
            let bytes: usize = self.turns.iter().map(|(_, t)| t.content.len()).sum();
            if (tokens <= self.max_tokens && bytes <= self.max_bytes) || self.turns.is_empty() {
                break;
            }
            self.turns.pop_lru();
        }
    }

    fn expire(&mut self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let expired: Vec<u64> = self
            .turns
            .iter()
            .filter(|(_, t)| t.recorded_at < cutoff)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            self.turns.pop(&seq);
        }
    }

    /// Turns in chronological order, TTL applied.
    pub fn turns(&mut self) -> Vec<ConversationTurn> {
        self.expire();
        let mut entries: Vec<(u64, ConversationTurn)> = self
            .turns
            .iter()
            .map(|(seq, t)| (*seq, t.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, t)| t).collect()
    }

    /// Render as prompt text, most recent last.
    pub fn render(&mut self) -> String {
        self.turns()
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn token_total(&self) -> usize {
        self.turns.iter().map(|(_, t)| t.tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Serialize the current state (for snapshots).
    pub fn state(&mut self) -> EphemeralState {
        EphemeralState {
            turns: self.turns(),
            ops_count: self.ops_count,
        }
    }

    /// Restore from a snapshot state.
    pub fn restore(&mut self, state: EphemeralState) {
        self.turns.clear();
        self.ops_count = state.ops_count;
        for turn in state.turns {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.turns.put(seq, turn);
        }
        self.enforce_caps();
    }

    /// Write the checkpoint file if a directory was configured.
    pub fn checkpoint(&mut self) {
        let Some(path) = self.checkpoint_path.clone() else {
            return;
        };
        let state = self.state();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    debug!(error = %e, "ephemeral checkpoint write failed");
                }
            }
            Err(e) => debug!(error = %e, "ephemeral checkpoint serialize failed"),
        }
    }

    /// Load a previously checkpointed state, if present.
    pub fn load_checkpoint(dir: &std::path::Path) -> Option<EphemeralState> {
        let path = dir.join("ephemeral.json");
        let data = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&data).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
