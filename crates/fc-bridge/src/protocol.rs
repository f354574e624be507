use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fc_core::types::{AgentKind, AgentStatus, SessionStatus};

// ---------------------------------------------------------------------------
// MonitorEvent
// ---------------------------------------------------------------------------

/// Every state mutation in the runtime emits one of these onto the bridge.
///
/// The enum is the wire contract for the WebSocket stream; variants and
/// field names stay backward-compatible across minor versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum MonitorEvent {
    // Orchestrator
    TurnStarted {
        session_id: Uuid,
        turn: u32,
    },
    TurnComplete {
        session_id: Uuid,
        turn: u32,
        tokens_used: u64,
    },
    ToolExecute {
        session_id: Uuid,
        tool: String,
        args_summary: String,
    },
    ToolResult {
        session_id: Uuid,
        tool: String,
        success: bool,
        duration_ms: u64,
    },
    SessionEnded {
        session_id: Uuid,
        status: SessionStatus,
    },

    // Model client
    TokenUsage {
        session_id: Uuid,
        prompt_tokens: u64,
        completion_tokens: u64,
    },

    // Memory
    Retrieval {
        session_id: Uuid,
        chunks: usize,
        degraded: bool,
    },
    Snapshot {
        session_id: Uuid,
        sequence: u64,
    },
    BudgetReport {
        session_id: Uuid,
        report: serde_json::Value,
    },

    // Mini-agent spawner
    AgentSpawned {
        agent_id: Uuid,
        parent_id: Uuid,
        kind: AgentKind,
    },
    AgentProgress {
        agent_id: Uuid,
        message: String,
    },
    AgentCompleted {
        agent_id: Uuid,
        status: AgentStatus,
    },

    // Infrastructure
    Error {
        source: String,
        kind: String,
        message: String,
    },
}

impl MonitorEvent {
    /// Topic prefix used on the WebSocket stream.
    pub fn topic(&self) -> &'static str {
        match self {
            MonitorEvent::TurnStarted { .. }
            | MonitorEvent::TurnComplete { .. }
            | MonitorEvent::SessionEnded { .. }
            | MonitorEvent::AgentSpawned { .. }
            | MonitorEvent::AgentProgress { .. }
            | MonitorEvent::AgentCompleted { .. } => "pipeline:",
            MonitorEvent::ToolExecute { .. } | MonitorEvent::ToolResult { .. } => "tool:",
            MonitorEvent::TokenUsage { .. }
            | MonitorEvent::Retrieval { .. }
            | MonitorEvent::Snapshot { .. }
            | MonitorEvent::BudgetReport { .. }
            | MonitorEvent::Error { .. } => "metrics:",
        }
    }

    /// Critical events are never dropped under back-pressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MonitorEvent::Error { .. } | MonitorEvent::SessionEnded { .. }
        )
    }

    /// Wrap with topic and timestamp for transport.
    pub fn envelope(self) -> MonitorEnvelope {
        MonitorEnvelope {
            topic: self.topic().to_string(),
            timestamp: Utc::now(),
            event: self,
        }
    }
}

/// The transported shape: topic prefix, timestamp, event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEnvelope {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: MonitorEvent,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
