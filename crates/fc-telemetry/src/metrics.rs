use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A label set is a sorted list of key=value pairs distinguishing counter
/// families (e.g. `tool="read_file"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// In-memory counter cache behind the monitoring endpoints.
///
/// Thread-safe via interior mutability (`RwLock` for dynamic registration,
/// `AtomicU64` for values). `reset` backs `POST /api/metrics/clear`; it
/// clears this cache only, never the durable counters in the session store.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_by(name, labels, 1);
    }

    /// Increment a counter by an arbitrary amount.
    pub fn increment_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        // Fast path: read lock.
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        // Slow path: write lock to insert.
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().expect("metrics lock poisoned");
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Sum across all label sets of a counter family.
    pub fn get_total(&self, name: &str) -> u64 {
        let map = self.counters.read().expect("metrics lock poisoned");
        map.iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// All counters as a flat JSON-ready list.
    pub fn snapshot(&self) -> Vec<(String, Vec<(String, String)>, u64)> {
        let map = self.counters.read().expect("metrics lock poisoned");
        let mut out: Vec<_> = map
            .iter()
            .map(|((name, labels), value)| {
                (
                    name.clone(),
                    labels.pairs().to_vec(),
                    value.load(Ordering::Relaxed),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Reset all in-memory counters to zero.
    pub fn reset(&self) {
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
