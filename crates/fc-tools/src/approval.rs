use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use fc_core::types::{ApprovalMode, Sensitivity};

use crate::contract::{Result, ToolError};
use crate::sensitivity::classify;

// ---------------------------------------------------------------------------
// ApprovalRequest / ApprovalDecision
// ---------------------------------------------------------------------------

/// A request put before the user (or UI) for one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub tool_name: String,
    pub args_summary: String,
    pub sensitivity: Sensitivity,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    /// Approve and remember for this `(tool, sensitivity)` pair.
    ApprovedRemembered,
    Denied,
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// How a pending approval reaches the user. Two implementations ship: a
/// synchronous console prompt and an asynchronous channel for UIs.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision;
}

/// Synchronous console prompt. An interrupted or closed stdin denies.
pub struct ConsolePrompt;

#[async_trait]
impl ApprovalTransport for ConsolePrompt {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision {
        let prompt = format!(
            "Allow {} [{:?}]? {}\n[y]es / [a]lways / [N]o: ",
            req.tool_name, req.sensitivity, req.args_summary,
        );
        tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => ApprovalDecision::Denied,
                Ok(_) => match line.trim().to_ascii_lowercase().as_str() {
                    "y" | "yes" => ApprovalDecision::Approved,
                    "a" | "always" => ApprovalDecision::ApprovedRemembered,
                    _ => ApprovalDecision::Denied,
                },
            }
        })
        .await
        .unwrap_or(ApprovalDecision::Denied)
    }
}

/// Asynchronous UI transport: requests are parked on a channel until some
/// resolver answers them. Dropping the resolver denies everything pending.
pub struct ChannelTransport {
    tx: flume::Sender<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
}

/// The resolving end handed to a UI loop.
pub struct ApprovalResolver {
    rx: flume::Receiver<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)>,
}

impl ChannelTransport {
    pub fn new() -> (Self, ApprovalResolver) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, ApprovalResolver { rx })
    }
}

impl ApprovalResolver {
    /// Wait for the next pending request.
    pub async fn next(&self) -> Option<(ApprovalRequest, oneshot::Sender<ApprovalDecision>)> {
        self.rx.recv_async().await.ok()
    }
}

#[async_trait]
impl ApprovalTransport for ChannelTransport {
    async fn request(&self, req: ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        if self.tx.send((req, tx)).is_err() {
            return ApprovalDecision::Denied;
        }
        rx.await.unwrap_or(ApprovalDecision::Denied)
    }
}

/// Fixed-answer transport for tests and non-interactive runs.
pub struct StaticTransport(pub ApprovalDecision);

#[async_trait]
impl ApprovalTransport for StaticTransport {
    async fn request(&self, _req: ApprovalRequest) -> ApprovalDecision {
        self.0
    }
}

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

/// Decides, per invocation, whether a tool call may proceed.
///
/// - `yolo` auto-approves everything.
/// - `auto_edit` auto-approves {none, low, medium}.
/// - `default` asks the user for everything that is not `none`.
///
/// "Approve & remember" answers are cached per `(tool, sensitivity)` for the
/// session; denials are never cached.
pub struct ApprovalGate {
    mode: std::sync::Mutex<ApprovalMode>,
    transport: Arc<dyn ApprovalTransport>,
    remembered: Mutex<HashMap<(String, Sensitivity), bool>>,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode, transport: Arc<dyn ApprovalTransport>) -> Self {
        Self {
            mode: std::sync::Mutex::new(mode),
            transport,
            remembered: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> ApprovalMode {
        *self.mode.lock().expect("approval mode lock poisoned")
    }

    /// Switch decision modes mid-session (`/approve always` in the REPL).
    pub fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.lock().expect("approval mode lock poisoned") = mode;
    }

    /// Drop all remembered approvals (`/approve never` in the REPL).
    pub async fn forget_all(&self) {
        self.remembered.lock().await.clear();
    }

    /// Gate one invocation. Returns the classified sensitivity on approval;
    /// denial is a permission error.
    pub async fn check(&self, tool_name: &str, args: &serde_json::Value) -> Result<Sensitivity> {
        let sensitivity = classify(tool_name, args);

        let auto = match self.mode() {
            ApprovalMode::Yolo => true,
            ApprovalMode::AutoEdit => sensitivity <= Sensitivity::Medium,
            ApprovalMode::Default => sensitivity == Sensitivity::None,
        };
        if auto {
            return Ok(sensitivity);
        }

        let cache_key = (tool_name.to_string(), sensitivity);
        if let Some(true) = self.remembered.lock().await.get(&cache_key) {
            return Ok(sensitivity);
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            tool_name: tool_name.to_string(),
            args_summary: summarize_args(args),
            sensitivity,
            requested_at: Utc::now(),
        };
        info!(tool = tool_name, ?sensitivity, "requesting approval");

        match self.transport.request(request).await {
            ApprovalDecision::Approved => Ok(sensitivity),
            ApprovalDecision::ApprovedRemembered => {
                self.remembered.lock().await.insert(cache_key, true);
                Ok(sensitivity)
            }
            ApprovalDecision::Denied => {
                warn!(tool = tool_name, ?sensitivity, "approval denied");
                Err(ToolError::Denied(format!("user denied {tool_name}")))
            }
        }
    }
}

fn summarize_args(args: &serde_json::Value) -> String {
    let text = args.to_string();
    if text.len() <= 200 {
        return text;
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i <= 200)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("{}…", &text[..cut])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
