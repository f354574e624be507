use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use fc_bridge::event_bus::EventBus;
use fc_bridge::protocol::MonitorEvent;
use fc_core::abort::AbortSignal;
use fc_core::error::{ErrorKind, Kinded};
use fc_core::store::SessionStore;
use fc_core::types::{ExecutionLog, ToolPermissions};
use fc_tools::approval::ApprovalGate;
use fc_tools::contract::{ToolError, ToolOutcome};
use fc_tools::registry::ToolRegistry;

use crate::segments::ToolCallRequest;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The user denied a tool; the turn must stop.
    #[error("operation denied: {0}")]
    Denied(String),
    /// The caller's abort fired.
    #[error("execution aborted")]
    Aborted,
    /// The per-turn tool-call budget ran out.
    #[error("tool call budget exhausted ({0} calls)")]
    CallBudgetExhausted(u32),
    #[error("store error: {0}")]
    Store(#[from] fc_core::store::StoreError),
}

impl Kinded for ExecutorError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Denied(_) => ErrorKind::Permission,
            ExecutorError::Aborted => ErrorKind::Timeout,
            ExecutorError::CallBudgetExhausted(_) => ErrorKind::Budget,
            ExecutorError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// ExecutedCall
// ---------------------------------------------------------------------------

/// The record of one executed (or failed) tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedCall {
    pub tool_name: String,
    pub args_summary: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Set when the one-shot recovery ladder rescued the call.
    pub recovered: bool,
}

impl ExecutedCall {
    /// Render as a tool-result message for the conversation.
    pub fn as_message(&self) -> String {
        if self.success {
            format!("[tool:{}] {}", self.tool_name, self.output)
        } else {
            format!(
                "[tool:{}] ERROR: {}",
                self.tool_name,
                self.error.as_deref().unwrap_or("unknown failure"),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs parsed tool calls through the approval gate and registry, applies
/// the one-shot recovery ladder, records execution logs, and emits
/// `tool-execute` / `tool-result` events.
pub struct Executor {
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    store: Arc<SessionStore>,
    bus: EventBus,
    cwd: PathBuf,
    tool_deadline: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<ApprovalGate>,
        store: Arc<SessionStore>,
        bus: EventBus,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            gate,
            store,
            bus,
            cwd: cwd.into(),
            tool_deadline: Duration::from_secs(60),
        }
    }

    pub fn with_tool_deadline(mut self, deadline: Duration) -> Self {
        self.tool_deadline = deadline;
        self
    }

    /// Execute calls in order. A denial or abort stops the batch and
    /// surfaces; ordinary tool failures are recorded and returned so the
    /// orchestrator can decide whether to continue.
    pub async fn execute_calls(
        &self,
        session_id: Uuid,
        calls: &[ToolCallRequest],
        abort: AbortSignal,
        permissions: &ToolPermissions,
        calls_remaining: &mut u32,
    ) -> Result<Vec<ExecutedCall>> {
        let mut results = Vec::new();
        for call in calls {
            if abort.is_aborted() {
                return Err(ExecutorError::Aborted);
            }
            if *calls_remaining == 0 {
                return Err(ExecutorError::CallBudgetExhausted(
                    permissions.max_tool_calls,
                ));
            }
            *calls_remaining -= 1;

            let executed = self
                .execute_one(session_id, call, abort.clone(), permissions)
                .await?;
            results.push(executed);
        }
        Ok(results)
    }

    async fn execute_one(
        &self,
        session_id: Uuid,
        call: &ToolCallRequest,
        abort: AbortSignal,
        permissions: &ToolPermissions,
    ) -> Result<ExecutedCall> {
        let args_summary = summarize(&call.args);
        self.bus.publish(MonitorEvent::ToolExecute {
            session_id,
            tool: call.name.clone(),
            args_summary: args_summary.clone(),
        });

        // Approval gate runs before anything touches the tool.
        match self.gate.check(&call.name, &call.args).await {
            Ok(_) => {}
            Err(ToolError::Denied(reason)) => {
                self.record(
                    session_id,
                    &call.name,
                    &args_summary,
                    false,
                    0,
                    Some(&reason),
                )
                .await?;
                return Err(ExecutorError::Denied(reason));
            }
            Err(other) => {
                let message = other.to_string();
                self.record(session_id, &call.name, &args_summary, false, 0, Some(&message))
                    .await?;
                return Err(ExecutorError::Denied(message));
            }
        }

        let started = std::time::Instant::now();
        let first = self
            .registry
            .invoke(
                &call.name,
                call.args.clone(),
                abort.clone(),
                self.tool_deadline,
                permissions,
            )
            .await;

        let (outcome, recovered) = match classify_for_recovery(&first, call) {
            Some(recovery) => {
                info!(tool = %call.name, ?recovery, "attempting one-shot recovery");
                let second = self
                    .apply_recovery(recovery, call, abort.clone(), permissions)
                    .await;
                match second {
                    Some(Ok(outcome)) if outcome.success => (Ok(outcome), true),
                    // Recovery failed too; surface the original outcome.
                    _ => (first, false),
                }
            }
            None => (first, false),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let executed = match outcome {
            Ok(tool_outcome) => ExecutedCall {
                tool_name: call.name.clone(),
                args_summary: args_summary.clone(),
                success: tool_outcome.success,
                output: tool_outcome.output,
                error: tool_outcome.error,
                duration_ms,
                recovered,
            },
            Err(ToolError::Aborted) => return Err(ExecutorError::Aborted),
            Err(err) => ExecutedCall {
                tool_name: call.name.clone(),
                args_summary: args_summary.clone(),
                success: false,
                output: String::new(),
                error: Some(err.to_string()),
                duration_ms,
                recovered,
            },
        };

        self.record(
            session_id,
            &executed.tool_name,
            &executed.args_summary,
            executed.success,
            executed.duration_ms,
            executed.error.as_deref(),
        )
        .await?;

        self.bus.publish(MonitorEvent::ToolResult {
            session_id,
            tool: executed.tool_name.clone(),
            success: executed.success,
            duration_ms: executed.duration_ms,
        });

        Ok(executed)
    }

    async fn record(
        &self,
        session_id: Uuid,
        tool_name: &str,
        args_summary: &str,
        success: bool,
        duration_ms: u64,
        error: Option<&str>,
    ) -> Result<()> {
        self.store
            .record_log(ExecutionLog {
                session_id,
                tool_name: tool_name.to_string(),
                args_summary: args_summary.to_string(),
                success,
                duration_ms,
                tokens_in: 0,
                tokens_out: 0,
                timestamp: Utc::now(),
                error: error.map(|e| e.to_string()),
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery ladder
    // -----------------------------------------------------------------------

    async fn apply_recovery(
        &self,
        recovery: Recovery,
        call: &ToolCallRequest,
        abort: AbortSignal,
        permissions: &ToolPermissions,
    ) -> Option<std::result::Result<ToolOutcome, ToolError>> {
        match recovery {
            Recovery::AlternatePaths(original) => {
                for candidate in [
                    self.cwd.join("src").join(&original),
                    self.cwd.join("lib").join(&original),
                ] {
                    let mut args = call.args.clone();
                    args["path"] =
                        serde_json::Value::String(candidate.to_string_lossy().into_owned());
                    let attempt = self
                        .registry
                        .invoke(&call.name, args, abort.clone(), self.tool_deadline, permissions)
                        .await;
                    if matches!(&attempt, Ok(o) if o.success) {
                        return Some(attempt);
                    }
                }
                None
            }
            Recovery::ResolveAgainstCwd(original) => {
                let mut args = call.args.clone();
                args["path"] = serde_json::Value::String(
                    self.cwd.join(&original).to_string_lossy().into_owned(),
                );
                Some(
                    self.registry
                        .invoke(&call.name, args, abort, self.tool_deadline, permissions)
                        .await,
                )
            }
            Recovery::SubstituteCommand(rewritten) => {
                let mut args = call.args.clone();
                args["command"] = serde_json::Value::String(rewritten);
                Some(
                    self.registry
                        .invoke(&call.name, args, abort, self.tool_deadline, permissions)
                        .await,
                )
            }
            Recovery::DecomposeCompound(parts) => {
                let mut combined_output = String::new();
                for part in parts {
                    let mut args = call.args.clone();
                    args["command"] = serde_json::Value::String(part);
                    match self
                        .registry
                        .invoke(&call.name, args, abort.clone(), self.tool_deadline, permissions)
                        .await
                    {
                        Ok(outcome) if outcome.success => {
                            combined_output.push_str(&outcome.output);
                            combined_output.push('\n');
                        }
                        other => return Some(other),
                    }
                }
                Some(Ok(ToolOutcome::ok(combined_output)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recovery classification
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Recovery {
    AlternatePaths(String),
    ResolveAgainstCwd(String),
    SubstituteCommand(String),
    DecomposeCompound(Vec<String>),
}

const READONLY_SUBSTITUTES: &[(&str, &str)] = &[
    ("rg", "grep -rn"),
    ("fd", "find . -name"),
    ("bat", "cat"),
    ("exa", "ls"),
    ("eza", "ls"),
];

fn classify_for_recovery(
    result: &std::result::Result<ToolOutcome, ToolError>,
    call: &ToolCallRequest,
) -> Option<Recovery> {
    let message = match result {
        Ok(outcome) if !outcome.success => outcome.error.as_deref().unwrap_or(""),
        Err(ToolError::DeadlineElapsed(_)) => "deadline elapsed",
        Err(ToolError::Invocation(m)) => m.as_str(),
        _ => return None,
    };
    let lowered = message.to_ascii_lowercase();
    let path = call.args.get("path").and_then(|v| v.as_str());
    let command = call.args.get("command").and_then(|v| v.as_str());

    if lowered.contains("file not found") || lowered.contains("no such file") {
        if let Some(path) = path {
            if !path.starts_with('/') {
                return Some(Recovery::AlternatePaths(path.to_string()));
            }
        }
    }

    if lowered.contains("absolute path") {
        if let Some(path) = path {
            return Some(Recovery::ResolveAgainstCwd(path.to_string()));
        }
    }

    if lowered.contains("command not found") || lowered.contains("not found") {
        if let Some(command) = command {
            let mut parts = command.splitn(2, ' ');
            let head = parts.next().unwrap_or("");
            if let Some((_, replacement)) =
                READONLY_SUBSTITUTES.iter().find(|(from, _)| *from == head)
            {
                let rest = parts.next().unwrap_or("");
                return Some(Recovery::SubstituteCommand(
                    format!("{replacement} {rest}").trim().to_string(),
                ));
            }
        }
    }

    if lowered.contains("deadline elapsed") || lowered.contains("timed out") {
        if let Some(command) = command {
            let parts: Vec<String> = command
                .split("&&")
                .flat_map(|p| p.split(" and "))
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() > 1 {
                return Some(Recovery::DecomposeCompound(parts));
            }
        }
    }

    warn!(tool = %call.name, error = message, "no recovery applies");
    None
}

fn summarize(args: &serde_json::Value) -> String {
    let text = args.to_string();
    if text.len() <= 120 {
        return text;
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i <= 120)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}…", &text[..cut])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fc_core::types::{ApprovalMode, Mode, Sensitivity};
    use fc_tools::approval::{ApprovalDecision, StaticTransport};
    use fc_tools::builtin::register_builtin_tools;
    use fc_tools::contract::Tool;
    use serde_json::json;

    async fn harness(
        mode: ApprovalMode,
        decision: ApprovalDecision,
    ) -> (Executor, tempfile::TempDir, Arc<SessionStore>, Uuid, ToolPermissions) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::in_memory().await.unwrap());
        let session = store.start_session("proj", Mode::Concise).await.unwrap();

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, dir.path());
        let perms = ToolPermissions::unrestricted(registry.names());

        let gate = Arc::new(ApprovalGate::new(mode, Arc::new(StaticTransport(decision))));
        let executor = Executor::new(
            Arc::new(registry),
            gate,
            Arc::clone(&store),
            EventBus::new(),
            dir.path(),
        )
        .with_tool_deadline(Duration::from_secs(5));
        (executor, dir, store, session.id, perms)
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest {
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn executes_calls_in_order_and_logs() {
        let (executor, dir, store, session_id, perms) =
            harness(ApprovalMode::Yolo, ApprovalDecision::Approved).await;
        std::fs::write(dir.path().join("package.json"), r#"{"dependencies":{}}"#).unwrap();

        let calls = vec![
            call("read_file", json!({"path": "package.json"})),
            call("write_file", json!({"path": "notes.md", "content": "deps"})),
        ];
        let mut remaining = 10;
        let results = executor
            .execute_calls(session_id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        let logs = store.logs_for_session(session_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].tool_name, "read_file");
        assert_eq!(logs[1].tool_name, "write_file");
        assert!(logs.iter().all(|l| l.success));
    }

    #[tokio::test]
    async fn denial_stops_the_batch_with_zero_invocations() {
        let (executor, dir, store, session_id, perms) =
            harness(ApprovalMode::Default, ApprovalDecision::Denied).await;

        let calls = vec![call("shell", json!({"command": "rm -rf logs"}))];
        let mut remaining = 10;
        let err = executor
            .execute_calls(session_id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Denied(_)));
        assert_eq!(err.kind(), ErrorKind::Permission);
        // Nothing ran: the workspace is untouched and the only log row is
        // the denial record.
        let logs = store.logs_for_session(session_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        drop(dir);
    }

    #[tokio::test]
    async fn file_not_found_recovers_via_src() {
        let (executor, dir, _store, session_id, perms) =
            harness(ApprovalMode::Yolo, ApprovalDecision::Approved).await;
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/config.rs"), "pub fn cfg() {}").unwrap();

        let calls = vec![call("read_file", json!({"path": "config.rs"}))];
        let mut remaining = 10;
        let results = executor
            .execute_calls(session_id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap();

        assert!(results[0].success);
        assert!(results[0].recovered);
        assert!(results[0].output.contains("pub fn cfg"));
    }

    #[tokio::test]
    async fn unrecoverable_failure_surfaces_structured_error() {
        let (executor, _dir, _store, session_id, perms) =
            harness(ApprovalMode::Yolo, ApprovalDecision::Approved).await;

        let calls = vec![call("read_file", json!({"path": "nope/missing.txt"}))];
        let mut remaining = 10;
        let results = executor
            .execute_calls(session_id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap();

        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("not found"));
        assert!(results[0].as_message().contains("ERROR"));
    }

    #[tokio::test]
    async fn call_budget_is_enforced() {
        let (executor, _dir, _store, session_id, perms) =
            harness(ApprovalMode::Yolo, ApprovalDecision::Approved).await;

        let calls = vec![
            call("list_directory", json!({})),
            call("list_directory", json!({})),
        ];
        let mut remaining = 1;
        let err = executor
            .execute_calls(session_id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::CallBudgetExhausted(_)));
    }

    #[tokio::test]
    async fn command_substitution_rewrites_missing_binary() {
        struct FailsOnRg;

        #[async_trait]
        impl Tool for FailsOnRg {
            fn name(&self) -> &str {
                "shell"
            }
            fn description(&self) -> &str {
                "fake shell"
            }
            fn parameter_schema(&self) -> serde_json::Value {
                json!({})
            }
            fn sensitivity_hint(&self) -> Sensitivity {
                Sensitivity::None
            }
            async fn invoke(
                &self,
                args: serde_json::Value,
                _abort: AbortSignal,
                _permissions: &ToolPermissions,
            ) -> std::result::Result<ToolOutcome, ToolError> {
                let command = args["command"].as_str().unwrap_or("");
                if command.starts_with("rg") {
                    Ok(ToolOutcome::fail("sh: rg: command not found"))
                } else {
                    Ok(ToolOutcome::ok(format!("ran: {command}")))
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::in_memory().await.unwrap());
        let session = store.start_session("proj", Mode::Concise).await.unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailsOnRg));
        let perms = ToolPermissions::unrestricted(registry.names());
        let gate = Arc::new(ApprovalGate::new(
            ApprovalMode::Yolo,
            Arc::new(StaticTransport(ApprovalDecision::Approved)),
        ));
        let executor = Executor::new(
            Arc::new(registry),
            gate,
            store,
            EventBus::new(),
            dir.path(),
        );

        let calls = vec![call("shell", json!({"command": "rg needle"}))];
        let mut remaining = 10;
        let results = executor
            .execute_calls(session.id, &calls, AbortSignal::never(), &perms, &mut remaining)
            .await
            .unwrap();

        assert!(results[0].success);
        assert!(results[0].recovered);
        assert!(results[0].output.contains("grep -rn needle"));
    }
}
