use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Global bias on token budgets for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Direct,
    #[default]
    Concise,
    Deep,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::Concise => write!(f, "concise"),
            Mode::Deep => write!(f, "deep"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Mode::Direct),
            "concise" => Ok(Mode::Concise),
            "deep" => Ok(Mode::Deep),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Crashed,
}

/// One active conversation within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project_id: String,
    pub mode: Mode,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub turn_count: u32,
    pub tokens_used: u64,
}

impl Session {
    pub fn new(project_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            mode,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            turn_count: 0,
            tokens_used: 0,
        }
    }
}

/// Append-only checkpoint sufficient to resume a session after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    /// Strictly increasing, gap-free within a session.
    pub sequence: u64,
    pub ephemeral_state: serde_json::Value,
    pub retrieval_ids: Vec<String>,
    pub mode: Mode,
    pub token_budget: serde_json::Value,
    pub last_command: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Code,
    Doc,
    Diff,
}

/// An indexed code or documentation fragment with its embedding.
///
/// The dedupe key is `(path, content_hash, line_span)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub project_id: String,
    pub path: String,
    pub content: String,
    pub chunk_type: ChunkType,
    pub token_count: usize,
    pub embedding: Vec<f32>,
    pub line_start: u32,
    pub line_end: u32,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// The dedupe key for retrieval uniqueness.
    pub fn dedupe_key(&self) -> (String, String, u32, u32) {
        (
            self.path.clone(),
            self.content_hash.clone(),
            self.line_start,
            self.line_end,
        )
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Per-commit record ingested from the project's git history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitRecord {
    pub project_id: String,
    pub hash: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub diff_summary: String,
}

/// A commit hash must be exactly 40 lowercase/uppercase hex characters.
pub fn valid_commit_hash(hash: &str) -> bool {
    hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

// ---------------------------------------------------------------------------
// Knowledge
// ---------------------------------------------------------------------------

/// A small structured fact ("preferences", "patterns") shared across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub key: String,
    pub value: String,
    pub category: String,
    pub importance_score: f64,
    pub token_count: usize,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

/// One tool invocation, durably recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub session_id: Uuid,
    pub tool_name: String,
    pub args_summary: String,
    pub success: bool,
    pub duration_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemAccess {
    Read,
    Write,
    #[default]
    None,
}

/// The permission envelope enforced on every tool call.
///
/// After policy application `restricted ∩ allowed = ∅`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermissions {
    pub allowed: BTreeSet<String>,
    pub restricted: BTreeSet<String>,
    pub read_only: bool,
    pub network_access: bool,
    pub filesystem_access: FilesystemAccess,
    pub dangerous_operations: bool,
    pub git_operations: bool,
    pub max_tool_calls: u32,
}

impl Default for ToolPermissions {
    fn default() -> Self {
        Self {
            allowed: BTreeSet::new(),
            restricted: BTreeSet::new(),
            read_only: true,
            network_access: false,
            filesystem_access: FilesystemAccess::Read,
            dangerous_operations: false,
            git_operations: false,
            max_tool_calls: 25,
        }
    }
}

impl ToolPermissions {
    /// A permissive envelope for the top-level orchestrator.
    pub fn unrestricted(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            restricted: BTreeSet::new(),
            read_only: false,
            network_access: true,
            filesystem_access: FilesystemAccess::Write,
            dangerous_operations: false,
            git_operations: true,
            max_tool_calls: 100,
        }
    }

    /// Intersect two envelopes: the result never grants more than either side.
    pub fn intersect(&self, other: &ToolPermissions) -> ToolPermissions {
        let allowed: BTreeSet<String> =
            self.allowed.intersection(&other.allowed).cloned().collect();
        let mut restricted: BTreeSet<String> =
            self.restricted.union(&other.restricted).cloned().collect();
        // Keep the invariant: restricted entries never appear in allowed.
        let allowed: BTreeSet<String> =
            allowed.difference(&restricted).cloned().collect();
        restricted.retain(|t| !allowed.contains(t));
        ToolPermissions {
            allowed,
            restricted,
            read_only: self.read_only || other.read_only,
            network_access: self.network_access && other.network_access,
            filesystem_access: match (self.filesystem_access, other.filesystem_access) {
                (FilesystemAccess::None, _) | (_, FilesystemAccess::None) => {
                    FilesystemAccess::None
                }
                (FilesystemAccess::Read, _) | (_, FilesystemAccess::Read) => {
                    FilesystemAccess::Read
                }
                _ => FilesystemAccess::Write,
            },
            dangerous_operations: self.dangerous_operations && other.dangerous_operations,
            git_operations: self.git_operations && other.git_operations,
            max_tool_calls: self.max_tool_calls.min(other.max_tool_calls),
        }
    }

    /// Whether a tool name passes this envelope.
    pub fn permits(&self, tool_name: &str) -> bool {
        self.allowed.contains(tool_name) && !self.restricted.contains(tool_name)
    }
}

// ---------------------------------------------------------------------------
// Mini-agent tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Search,
    Migration,
    Analysis,
    Refactor,
    Test,
    Documentation,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A read-only projection of parent memory exposed to a mini-agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedContext {
    pub relevant_files: Vec<String>,
    pub search_patterns: Vec<String>,
    pub summary: Option<String>,
}

/// A delegated work item handed to the mini-agent spawner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniAgentTask {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub kind: AgentKind,
    pub prompt: String,
    pub scoped_context: ScopedContext,
    pub permissions: ToolPermissions,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AgentStatus::Spawning | AgentStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Sensitivity classification used by the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Default,
    AutoEdit,
    Yolo,
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(ApprovalMode::Default),
            "auto_edit" | "auto-edit" => Ok(ApprovalMode::AutoEdit),
            "yolo" => Ok(ApprovalMode::Yolo),
            other => Err(format!("unknown approval mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_roundtrip() {
        assert_eq!("direct".parse::<Mode>().unwrap(), Mode::Direct);
        assert_eq!("Concise".parse::<Mode>().unwrap(), Mode::Concise);
        assert_eq!("DEEP".parse::<Mode>().unwrap(), Mode::Deep);
        assert!("fast".parse::<Mode>().is_err());
    }

    #[test]
    fn commit_hash_validation() {
        assert!(valid_commit_hash(&"a".repeat(40)));
        assert!(valid_commit_hash(&"0123456789abcdef0123456789abcdef01234567"));
        assert!(!valid_commit_hash("abc123"));
        assert!(!valid_commit_hash(&"g".repeat(40)));
        assert!(!valid_commit_hash(&"a".repeat(41)));
    }

    #[test]
    fn permission_intersection_never_widens() {
        let template = ToolPermissions {
            allowed: ["read_file", "write_file", "shell"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            restricted: ["shell"].iter().map(|s| s.to_string()).collect(),
            read_only: false,
            network_access: true,
            filesystem_access: FilesystemAccess::Write,
            dangerous_operations: false,
            git_operations: true,
            max_tool_calls: 50,
        };
        let requested = ToolPermissions {
            allowed: ["read_file", "shell", "web_search"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            restricted: BTreeSet::new(),
            read_only: false,
            network_access: false,
            filesystem_access: FilesystemAccess::Read,
            dangerous_operations: true,
            git_operations: true,
            max_tool_calls: 80,
        };

        let merged = template.intersect(&requested);
        assert!(merged.allowed.contains("read_file"));
        // `shell` is restricted on one side, so it cannot survive.
        assert!(!merged.allowed.contains("shell"));
        assert!(!merged.allowed.contains("web_search"));
        assert!(!merged.network_access);
        assert!(!merged.dangerous_operations);
        assert_eq!(merged.filesystem_access, FilesystemAccess::Read);
        assert_eq!(merged.max_tool_calls, 50);
        // Invariant: restricted ∩ allowed = ∅.
        assert!(merged.allowed.is_disjoint(&merged.restricted));
    }

    #[test]
    fn permits_requires_allowed_and_not_restricted() {
        let perms = ToolPermissions {
            allowed: ["read_file", "grep"].iter().map(|s| s.to_string()).collect(),
            restricted: ["grep"].iter().map(|s| s.to_string()).collect(),
            ..ToolPermissions::default()
        };
        assert!(perms.permits("read_file"));
        assert!(!perms.permits("grep"));
        assert!(!perms.permits("shell"));
    }

    #[test]
    fn agent_status_terminality() {
        assert!(!AgentStatus::Spawning.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(AgentStatus::Timeout.is_terminal());
        assert!(AgentStatus::Cancelled.is_terminal());
    }

    #[test]
    fn sensitivity_ordering() {
        assert!(Sensitivity::None < Sensitivity::Low);
        assert!(Sensitivity::Low < Sensitivity::Medium);
        assert!(Sensitivity::Medium < Sensitivity::High);
        assert!(Sensitivity::High < Sensitivity::Critical);
    }

    #[test]
    fn priority_ordering_high_wins() {
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
