use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::error::{ErrorKind, Kinded};
use crate::types::Mode;

/// Marker appended whenever trimming actually removed text.
pub const TRUNCATION_MARKER: &str = "…";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("token budget exceeded for {category:?}: requested {requested}, available {available}")]
    Exceeded {
        category: BudgetCategory,
        requested: usize,
        available: usize,
    },
    #[error("hard input ceiling exceeded: {requested} tokens over {ceiling}")]
    InputCeiling { requested: usize, ceiling: usize },
}

impl Kinded for BudgetError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Budget
    }
}

pub type Result<T> = std::result::Result<T, BudgetError>;

// ---------------------------------------------------------------------------
// TokenCounter
// ---------------------------------------------------------------------------

/// Counts tokens with the cl100k_base encoder, falling back to a
/// `ceil(len/4)` estimate when the encoder cannot be constructed.
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base().ok(),
        }
    }

    /// A counter that always uses the length heuristic (for tests).
    pub fn heuristic() -> Self {
        Self { bpe: None }
    }

    /// Whether the real tokenizer is active.
    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }

    /// Trim `text` so its token count fits within `max`, preserving sentence
    /// boundaries when one falls in the back half of the kept prefix.
    ///
    /// Idempotent: trimming an already-fitting string returns it unchanged.
    pub fn trim_to_fit(&self, text: &str, max: usize) -> String {
        if self.count(text) <= max {
            return text.to_string();
        }
        if max == 0 {
            return String::new();
        }

        // Binary search over char-boundary prefix lengths for the longest
        // prefix that leaves room for the truncation marker.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let budget = max.saturating_sub(self.count(TRUNCATION_MARKER));

        let mut lo = 0usize;
        let mut hi = boundaries.len() - 1;
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.count(&text[..boundaries[mid]]) <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        let mut cut = boundaries[lo];

        // Prefer ending on a sentence boundary if one exists in the back
        // half of the kept prefix.
        let prefix = &text[..cut];
        if let Some(pos) = prefix.rfind(['.', '!', '?', '\n']) {
            if pos + 1 >= cut / 2 {
                cut = pos + 1;
            }
        }

        let mut out = text[..cut].to_string();
        out.push_str(TRUNCATION_MARKER);
        debug!(original = text.len(), kept = cut, max, "trimmed text to budget");
        out
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Categories and per-mode caps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    Ephemeral,
    Retrieved,
    Knowledge,
    Query,
    Safety,
    Buffer,
    Output,
    Reasoning,
}

impl BudgetCategory {
    pub const INPUT: [BudgetCategory; 6] = [
        BudgetCategory::Ephemeral,
        BudgetCategory::Retrieved,
        BudgetCategory::Knowledge,
        BudgetCategory::Query,
        BudgetCategory::Safety,
        BudgetCategory::Buffer,
    ];

    pub fn is_input(self) -> bool {
        !matches!(self, BudgetCategory::Output | BudgetCategory::Reasoning)
    }

    /// Over-limit additions to these categories fail instead of trimming;
    /// the caller must observe the condition.
    pub fn is_strict(self) -> bool {
        matches!(self, BudgetCategory::Query | BudgetCategory::Buffer)
    }
}

/// Hard ceiling on total prompt input, independent of mode.
pub const INPUT_CEILING: usize = 128_000;
/// Hard ceiling on completion output, independent of mode.
pub const OUTPUT_CEILING: usize = 32_000;

/// Per-mode token caps for every category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeBudget {
    pub ephemeral: usize,
    pub retrieved: usize,
    pub knowledge: usize,
    pub query: usize,
    pub safety: usize,
    pub buffer: usize,
    pub output: usize,
    pub reasoning: usize,
}

impl ModeBudget {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Direct => Self {
                ephemeral: 2_000,
                retrieved: 10_000,
                knowledge: 1_000,
                query: 1_000,
                safety: 4_000,
                buffer: 4_000,
                output: 1_000,
                reasoning: 200,
            },
            Mode::Concise => Self {
                ephemeral: 5_000,
                retrieved: 40_000,
                knowledge: 2_000,
                query: 2_000,
                safety: 10_000,
                buffer: 20_000,
                output: 6_000,
                reasoning: 5_000,
            },
            Mode::Deep => Self {
                ephemeral: 8_000,
                retrieved: 60_000,
                knowledge: 2_000,
                query: 4_000,
                safety: 16_000,
                buffer: 30_000,
                output: 15_000,
                reasoning: 12_000,
            },
        }
    }

    pub fn cap(&self, category: BudgetCategory) -> usize {
        match category {
            BudgetCategory::Ephemeral => self.ephemeral,
            BudgetCategory::Retrieved => self.retrieved,
            BudgetCategory::Knowledge => self.knowledge,
            BudgetCategory::Query => self.query,
            BudgetCategory::Safety => self.safety,
            BudgetCategory::Buffer => self.buffer,
            BudgetCategory::Output => self.output,
            BudgetCategory::Reasoning => self.reasoning,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBudgetManager
// ---------------------------------------------------------------------------

/// Usage entry in a [`BudgetReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub category: BudgetCategory,
    pub used: usize,
    pub cap: usize,
}

/// Structured usage report for monitoring and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReport {
    pub mode: Mode,
    pub categories: Vec<CategoryUsage>,
    pub input_used: usize,
    pub input_ceiling: usize,
    pub output_used: usize,
    pub output_ceiling: usize,
}

/// Mode-aware token accountant for one session turn.
///
/// All `can_add` / `trim_to_fit` queries resolve against the current mode's
/// caps. Category totals always equal the sum of successful `record` calls.
pub struct TokenBudgetManager {
    mode: Mode,
    budget: ModeBudget,
    counter: TokenCounter,
    used: HashMap<BudgetCategory, usize>,
}

impl TokenBudgetManager {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            budget: ModeBudget::for_mode(mode),
            counter: TokenCounter::new(),
            used: HashMap::new(),
        }
    }

    /// Build with a specific counter (tests use the heuristic one).
    pub fn with_counter(mode: Mode, counter: TokenCounter) -> Self {
        Self {
            mode,
            budget: ModeBudget::for_mode(mode),
            counter,
            used: HashMap::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switch modes mid-session; recorded usage is preserved.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.budget = ModeBudget::for_mode(mode);
    }

    pub fn count(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn used(&self, category: BudgetCategory) -> usize {
        self.used.get(&category).copied().unwrap_or(0)
    }

    pub fn remaining(&self, category: BudgetCategory) -> usize {
        self.budget.cap(category).saturating_sub(self.used(category))
    }

    pub fn input_used(&self) -> usize {
        BudgetCategory::INPUT.iter().map(|c| self.used(*c)).sum()
    }

    pub fn output_used(&self) -> usize {
        self.used(BudgetCategory::Output) + self.used(BudgetCategory::Reasoning)
    }

    /// Whether `text` fits the category's remaining budget and the hard
    /// input ceiling.
    pub fn can_add(&self, category: BudgetCategory, text: &str) -> bool {
        let tokens = self.counter.count(text);
        if tokens > self.remaining(category) {
            return false;
        }
        if category.is_input() && self.input_used() + tokens > INPUT_CEILING {
            return false;
        }
        true
    }

    /// Record a token spend against a category.
    ///
    /// Over-limit additions fail with [`BudgetError::Exceeded`]; nothing is
    /// partially recorded.
    pub fn record(&mut self, category: BudgetCategory, tokens: usize) -> Result<()> {
        let available = self.remaining(category);
        if tokens > available {
            return Err(BudgetError::Exceeded {
                category,
                requested: tokens,
                available,
            });
        }
        if category.is_input() && self.input_used() + tokens > INPUT_CEILING {
            return Err(BudgetError::InputCeiling {
                requested: self.input_used() + tokens,
                ceiling: INPUT_CEILING,
            });
        }
        *self.used.entry(category).or_insert(0) += tokens;
        Ok(())
    }

    /// Trim `text` to the category's remaining budget.
    pub fn trim_to_fit(&self, category: BudgetCategory, text: &str) -> String {
        self.counter.trim_to_fit(text, self.remaining(category))
    }

    pub fn report(&self) -> BudgetReport {
        let all = [
            BudgetCategory::Ephemeral,
            BudgetCategory::Retrieved,
            BudgetCategory::Knowledge,
            BudgetCategory::Query,
            BudgetCategory::Safety,
            BudgetCategory::Buffer,
            BudgetCategory::Output,
            BudgetCategory::Reasoning,
        ];
        BudgetReport {
            mode: self.mode,
            categories: all
                .iter()
                .map(|c| CategoryUsage {
                    category: *c,
                    used: self.used(*c),
                    cap: self.budget.cap(*c),
                })
                .collect(),
            input_used: self.input_used(),
            input_ceiling: INPUT_CEILING,
            output_used: self.output_used(),
            output_ceiling: OUTPUT_CEILING,
        }
    }

    /// Reset all recorded usage (start of a new turn).
    pub fn reset(&mut self) {
        self.used.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_count_is_ceil_len_over_4() {
        let c = TokenCounter::heuristic();
        assert_eq!(c.count(""), 0);
        assert_eq!(c.count("abc"), 1);
        assert_eq!(c.count("abcd"), 1);
        assert_eq!(c.count("abcde"), 2);
    }

    #[test]
    fn count_is_monotone_in_length() {
        let c = TokenCounter::new();
        let short = "the quick brown fox";
        let long = "the quick brown fox jumps over the lazy dog";
        assert!(c.count(short) <= c.count(long));
    }

    #[test]
    fn trim_is_idempotent() {
        let c = TokenCounter::heuristic();
        let text = "First sentence here. Second sentence follows. Third one closes it out.";
        let once = c.trim_to_fit(text, 8);
        let twice = c.trim_to_fit(&once, 8);
        assert_eq!(once, twice);
        assert!(c.count(&once) <= 8);
    }

    #[test]
    fn trim_noop_when_fitting() {
        let c = TokenCounter::heuristic();
        let text = "short";
        assert_eq!(c.trim_to_fit(text, 100), text);
    }

    #[test]
    fn trim_emits_marker_and_prefers_sentence_boundary() {
        let c = TokenCounter::heuristic();
        let text = "Alpha beta gamma delta. Epsilon zeta eta theta iota kappa lambda mu.";
        let trimmed = c.trim_to_fit(text, 10);
        assert!(trimmed.ends_with(TRUNCATION_MARKER));
        // The cut lands on the first sentence when it sits in the back half.
        assert!(trimmed.starts_with("Alpha beta gamma delta."));
    }

    #[test]
    fn trim_handles_multibyte_chars() {
        let c = TokenCounter::heuristic();
        let text = "héllo wörld ünïcödé çhàracters everywhere répéated çontent";
        let trimmed = c.trim_to_fit(text, 5);
        assert!(c.count(&trimmed) <= 5);
    }

    #[test]
    fn mode_caps_match_contract() {
        let d = ModeBudget::for_mode(Mode::Direct);
        assert_eq!(d.output, 1_000);
        assert_eq!(d.reasoning, 200);
        let c = ModeBudget::for_mode(Mode::Concise);
        assert_eq!(c.output, 6_000);
        assert_eq!(c.reasoning, 5_000);
        assert_eq!(c.ephemeral, 5_000);
        assert_eq!(c.retrieved, 40_000);
        assert_eq!(c.knowledge, 2_000);
        assert_eq!(c.query, 2_000);
        assert_eq!(c.safety, 10_000);
        let deep = ModeBudget::for_mode(Mode::Deep);
        assert_eq!(deep.output, 15_000);
        assert_eq!(deep.reasoning, 12_000);
    }

    #[test]
    fn record_tracks_totals_exactly() {
        let mut mgr =
            TokenBudgetManager::with_counter(Mode::Concise, TokenCounter::heuristic());
        mgr.record(BudgetCategory::Ephemeral, 100).unwrap();
        mgr.record(BudgetCategory::Ephemeral, 250).unwrap();
        mgr.record(BudgetCategory::Retrieved, 1_000).unwrap();
        assert_eq!(mgr.used(BudgetCategory::Ephemeral), 350);
        assert_eq!(mgr.used(BudgetCategory::Retrieved), 1_000);
        assert_eq!(mgr.input_used(), 1_350);
    }

    #[test]
    fn over_limit_query_fails_loudly() {
        let mut mgr =
            TokenBudgetManager::with_counter(Mode::Concise, TokenCounter::heuristic());
        // Concise query cap is 2000.
        mgr.record(BudgetCategory::Query, 1_500).unwrap();
        let err = mgr.record(BudgetCategory::Query, 1_000).unwrap_err();
        match err {
            BudgetError::Exceeded {
                category,
                requested,
                available,
            } => {
                assert_eq!(category, BudgetCategory::Query);
                assert_eq!(requested, 1_000);
                assert_eq!(available, 500);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed add left the total untouched.
        assert_eq!(mgr.used(BudgetCategory::Query), 1_500);
    }

    #[test]
    fn can_add_respects_mode_caps() {
        let mgr = TokenBudgetManager::with_counter(Mode::Direct, TokenCounter::heuristic());
        // Direct query cap is 1000 tokens = ~4000 chars under the heuristic.
        assert!(mgr.can_add(BudgetCategory::Query, "short query"));
        let huge = "x".repeat(40_000);
        assert!(!mgr.can_add(BudgetCategory::Query, &huge));
    }

    #[test]
    fn report_reflects_usage() {
        let mut mgr =
            TokenBudgetManager::with_counter(Mode::Concise, TokenCounter::heuristic());
        mgr.record(BudgetCategory::Safety, 400).unwrap();
        mgr.record(BudgetCategory::Output, 120).unwrap();
        let report = mgr.report();
        assert_eq!(report.mode, Mode::Concise);
        assert_eq!(report.input_used, 400);
        assert_eq!(report.output_used, 120);
        assert_eq!(report.input_ceiling, INPUT_CEILING);
        let safety = report
            .categories
            .iter()
            .find(|c| c.category == BudgetCategory::Safety)
            .unwrap();
        assert_eq!(safety.used, 400);
        assert_eq!(safety.cap, 10_000);
    }

    #[test]
    fn mode_switch_keeps_usage() {
        let mut mgr =
            TokenBudgetManager::with_counter(Mode::Direct, TokenCounter::heuristic());
        mgr.record(BudgetCategory::Ephemeral, 500).unwrap();
        mgr.set_mode(Mode::Deep);
        assert_eq!(mgr.used(BudgetCategory::Ephemeral), 500);
        assert_eq!(mgr.remaining(BudgetCategory::Ephemeral), 8_000 - 500);
    }
}
