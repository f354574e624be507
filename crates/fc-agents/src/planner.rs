use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Decompositions larger than this switch to the chunked streaming path.
pub const STREAMING_THRESHOLD: usize = 100;

/// Prompts with more than this many distinct operations count as complex.
pub const UNRELATED_OPS_THRESHOLD: usize = 10;

const DEDUPE_PREFIX: usize = 50;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskVerb {
    Search,
    Read,
    Write,
    Create,
    Edit,
    Run,
    Test,
    Analyze,
    Check,
    Find,
}

impl TaskVerb {
    fn from_word(word: &str) -> Option<TaskVerb> {
        match word.to_ascii_lowercase().as_str() {
            "search" | "look" | "grep" => Some(TaskVerb::Search),
            "read" | "open" | "view" => Some(TaskVerb::Read),
            "write" | "save" | "update" => Some(TaskVerb::Write),
            "create" | "add" | "make" | "generate" => Some(TaskVerb::Create),
            "edit" | "modify" | "change" | "refactor" => Some(TaskVerb::Edit),
            "run" | "execute" | "launch" => Some(TaskVerb::Run),
            "test" | "verify" => Some(TaskVerb::Test),
            "analyze" | "analyse" | "review" => Some(TaskVerb::Analyze),
            "check" | "validate" | "lint" => Some(TaskVerb::Check),
            "find" | "locate" => Some(TaskVerb::Find),
            _ => None,
        }
    }

    /// Verbs that mutate the target they name.
    fn writes(self) -> bool {
        matches!(self, TaskVerb::Write | TaskVerb::Create | TaskVerb::Edit)
    }

    fn reads(self) -> bool {
        matches!(self, TaskVerb::Read | TaskVerb::Search | TaskVerb::Find | TaskVerb::Analyze)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// One planned sub-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: Uuid,
    pub description: String,
    pub verb: TaskVerb,
    pub target: Option<String>,
    pub deps: Vec<Uuid>,
    pub status: TaskStatus,
    pub retries_max: u32,
    pub timeout_ms: u64,
}

/// The planner's output: an ordered task list forming a DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<PlanTask>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks with no dependencies; safe to run in parallel.
    pub fn parallelizable(&self) -> Vec<&PlanTask> {
        self.tasks.iter().filter(|t| t.deps.is_empty()).collect()
    }

    /// Topological execution order. The construction only ever adds edges
    /// from earlier to later tasks, so a cycle would be a bug; the sort
    /// detects one anyway and falls back to declaration order.
    pub fn execution_order(&self) -> Vec<&PlanTask> {
        let index: HashMap<Uuid, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
        let mut indegree: Vec<usize> = self
            .tasks
            .iter()
            .map(|t| t.deps.iter().filter(|d| index.contains_key(d)).count())
            .collect();
        let mut ready: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut cursor = 0;
        while cursor < ready.len() {
            let current = ready[cursor];
            cursor += 1;
            order.push(current);
            for (i, task) in self.tasks.iter().enumerate() {
                if task.deps.contains(&self.tasks[current].id) {
                    indegree[i] -= 1;
                    if indegree[i] == 0 {
                        ready.push(i);
                    }
                }
            }
        }
        if order.len() != self.tasks.len() {
            return self.tasks.iter().collect();
        }
        order.into_iter().map(|i| &self.tasks[i]).collect()
    }
}

/// Prompt complexity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    /// Answerable in one pass, no decomposition needed.
    Simple,
    /// Worth decomposing in a single pass.
    Enumerated(usize),
    /// Streamed decomposition (> [`STREAMING_THRESHOLD`] sub-tasks or too
    /// many unrelated operations).
    Complex(usize),
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Decomposes a free-form prompt into a dependency-ordered task list.
pub struct Planner {
    pub default_timeout_ms: u64,
}

impl Planner {
    pub fn new(default_timeout_ms: u64) -> Self {
        Self { default_timeout_ms }
    }

    /// Count enumerated items and imperative verbs to classify complexity.
    pub fn classify(&self, prompt: &str) -> Complexity {
        let items = candidate_items(prompt);
        let actionable = items
            .iter()
            .filter(|i| leading_verb(i).is_some())
            .count();
        if actionable <= 1 {
            return Complexity::Simple;
        }
        // Operations are unrelated when nothing else touches their target.
        let mut target_counts: HashMap<String, usize> = HashMap::new();
        for item in &items {
            if leading_verb(item).is_some() {
                let key = extract_target(item).unwrap_or_else(|| item.clone());
                *target_counts.entry(key).or_insert(0) += 1;
            }
        }
        let unrelated = target_counts.values().filter(|n| **n == 1).count();
        if actionable > STREAMING_THRESHOLD || unrelated > UNRELATED_OPS_THRESHOLD {
            Complexity::Complex(actionable)
        } else {
            Complexity::Enumerated(actionable)
        }
    }

    /// Decompose a prompt. Complex prompts go through the chunked streaming
    /// path; everything else decomposes in a single pass.
    pub fn decompose(&self, prompt: &str) -> Plan {
        let items = candidate_items(prompt);
        let plan = match self.classify(prompt) {
            Complexity::Simple => Plan::default(),
            Complexity::Enumerated(_) => self.build_plan(items.iter().map(String::as_str)),
            Complexity::Complex(n) => {
                debug!(subtasks = n, "streaming decomposition");
                // Stream in fixed-size windows; the dedupe and dependency
                // state carries across windows.
                let mut builder = PlanBuilder::new(self.default_timeout_ms);
                for window in items.chunks(50) {
                    for item in window {
                        builder.push(item);
                    }
                }
                builder.finish()
            }
        };
        debug!(tasks = plan.len(), "decomposition complete");
        plan
    }

    fn build_plan<'a>(&self, items: impl Iterator<Item = &'a str>) -> Plan {
        let mut builder = PlanBuilder::new(self.default_timeout_ms);
        for item in items {
            builder.push(item);
        }
        builder.finish()
    }
}

// ---------------------------------------------------------------------------
// PlanBuilder: dedupe + dependency inference
// ---------------------------------------------------------------------------

struct PlanBuilder {
    tasks: Vec<PlanTask>,
    seen: HashSet<String>,
    /// Last task that read each target, for write-after-read edges.
    last_read: HashMap<String, Uuid>,
    timeout_ms: u64,
}

impl PlanBuilder {
    fn new(timeout_ms: u64) -> Self {
        Self {
            tasks: Vec::new(),
            seen: HashSet::new(),
            last_read: HashMap::new(),
            timeout_ms,
        }
    }

    fn push(&mut self, item: &str) {
        let Some((verb, _)) = leading_verb(item) else {
            return;
        };
        let description = item.trim().to_string();
        let key: String = description.chars().take(DEDUPE_PREFIX).collect();
        if !self.seen.insert(key) {
            return;
        }

        let target = extract_target(&description);
        let mut deps = Vec::new();
        if verb.writes() {
            if let Some(ref target) = target {
                // A write after a read of the same path depends on that read.
                if let Some(read_id) = self.last_read.get(target) {
                    deps.push(*read_id);
                }
            }
        }

        let task = PlanTask {
            id: Uuid::new_v4(),
            description,
            verb,
            target: target.clone(),
            deps,
            status: TaskStatus::Pending,
            retries_max: 2,
            timeout_ms: self.timeout_ms,
        };
        if verb.reads() {
            if let Some(target) = target {
                self.last_read.insert(target, task.id);
            }
        }
        self.tasks.push(task);
    }

    fn finish(self) -> Plan {
        Plan { tasks: self.tasks }
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Split a prompt into candidate sub-task items: one per line for numbered
/// and bulleted lists, sentence-split otherwise.
fn candidate_items(prompt: &str) -> Vec<String> {
    let mut items = Vec::new();
    for line in prompt.lines() {
        let stripped = strip_list_marker(line.trim());
        if stripped.is_empty() {
            continue;
        }
        // Split on sentence boundaries (". " keeps dotted file names whole)
        // and "then" connectors.
        for sentence in stripped.split(';').flat_map(|s| s.split(". ")) {
            for part in sentence.split(" then ") {
                let part = part
                    .trim()
                    .trim_end_matches('.')
                    .trim_start_matches("and ")
                    .trim();
                if !part.is_empty() {
                    items.push(part.to_string());
                }
            }
        }
    }
    items
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•']).trim_start();
    // Numbered markers: "12." or "3)"
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return stripped.trim_start();
        }
    }
    line
}

fn leading_verb(item: &str) -> Option<(TaskVerb, &str)> {
    let mut words = item.split_whitespace();
    let first = words.next()?;
    TaskVerb::from_word(first).map(|v| (v, item))
}

/// Pull a path-like or quoted target out of a task description.
fn extract_target(description: &str) -> Option<String> {
    // Quoted names first.
    if let Some(start) = description.find('"') {
        if let Some(len) = description[start + 1..].find('"') {
            return Some(description[start + 1..start + 1 + len].to_string());
        }
    }
    description
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == ',' || c == ':' || c == '(' || c == ')'))
        .find(|t| t.contains('/') || (t.contains('.') && !t.ends_with('.')))
        .map(|t| t.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> Planner {
        Planner::new(30_000)
    }

    #[test]
    fn simple_prompt_is_not_decomposed() {
        let planner = planner();
        assert_eq!(planner.classify("what does this repo do?"), Complexity::Simple);
        assert!(planner.decompose("what does this repo do?").is_empty());
    }

    #[test]
    fn enumerated_list_is_classified_and_split() {
        let planner = planner();
        let prompt = "1. read src/main.rs\n2. create notes.md\n3. run the tests";
        match planner.classify(prompt) {
            Complexity::Enumerated(n) => assert_eq!(n, 3),
            other => panic!("unexpected: {other:?}"),
        }
        let plan = planner.decompose(prompt);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.tasks[0].verb, TaskVerb::Read);
        assert_eq!(plan.tasks[1].verb, TaskVerb::Create);
        assert_eq!(plan.tasks[2].verb, TaskVerb::Run);
    }

    #[test]
    fn twenty_five_step_prompt_yields_dag() {
        let planner = planner();
        let mut lines = Vec::new();
        for i in 0..5 {
            lines.push(format!("{}. search for usages of mod{i}", i * 5 + 1));
            lines.push(format!("{}. create file{i}.rs", i * 5 + 2));
            lines.push(format!("{}. read config{i}.toml", i * 5 + 3));
            lines.push(format!("{}. update config{i}.toml", i * 5 + 4));
            lines.push(format!("{}. run build step {i}", i * 5 + 5));
        }
        let prompt = lines.join("\n");
        let plan = planner.decompose(&prompt);

        assert!(plan.len() >= 20, "expected >= 20 tasks, got {}", plan.len());

        // Unique ids.
        let ids: HashSet<Uuid> = plan.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), plan.len());

        // Dependencies form a DAG over known ids; execution order respects
        // them.
        let order = plan.execution_order();
        assert_eq!(order.len(), plan.len());
        let mut seen = HashSet::new();
        for task in order {
            for dep in &task.deps {
                assert!(seen.contains(dep), "dependency executed after dependent");
            }
            seen.insert(task.id);
        }

        // No task appears twice.
        let descriptions: HashSet<&str> =
            plan.tasks.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(descriptions.len(), plan.len());
    }

    #[test]
    fn write_after_read_depends_on_the_read() {
        let planner = planner();
        let plan = planner.decompose("1. read config.toml\n2. update config.toml\n3. run tests");
        assert_eq!(plan.len(), 3);
        let read = &plan.tasks[0];
        let write = &plan.tasks[1];
        assert_eq!(write.deps, vec![read.id]);
        // The unrelated run task has no deps and is parallelizable.
        assert!(plan.tasks[2].deps.is_empty());
        assert!(plan
            .parallelizable()
            .iter()
            .any(|t| t.description.contains("run tests")));
    }

    #[test]
    fn duplicates_are_removed_by_prefix() {
        let planner = planner();
        let plan = planner.decompose("1. read main.rs\n2. read main.rs\n3. run tests");
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn defaults_are_applied() {
        let planner = planner();
        let plan = planner.decompose("1. read a.txt\n2. run build");
        for task in &plan.tasks {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.retries_max, 2);
            assert_eq!(task.timeout_ms, 30_000);
        }
    }

    #[test]
    fn over_threshold_goes_streaming_with_same_semantics() {
        let planner = planner();
        let lines: Vec<String> = (0..120)
            .map(|i| format!("{}. create module_{i}.rs", i + 1))
            .collect();
        let prompt = lines.join("\n");
        match planner.classify(&prompt) {
            Complexity::Complex(n) => assert!(n > STREAMING_THRESHOLD),
            other => panic!("unexpected: {other:?}"),
        }
        let plan = planner.decompose(&prompt);
        assert_eq!(plan.len(), 120);
    }

    #[test]
    fn many_distinct_operations_count_as_complex() {
        let planner = planner();
        let prompt = "1. search a\n2. read b.txt\n3. write c.txt\n4. create d\n5. edit e.txt\n\
                      6. run f\n7. test g\n8. analyze h\n9. check i\n10. find j\n11. grep k\n12. validate l";
        assert!(matches!(planner.classify(prompt), Complexity::Complex(_)));
    }
}
