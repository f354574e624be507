use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fc_core::abort::AbortSignal;
use fc_core::error::{ErrorKind, Kinded};
use fc_core::types::{Sensitivity, ToolPermissions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// No tool matched the requested name. Carries the available names so
    /// the model can be told what exists.
    #[error("tool not found: {name}")]
    NotFound { name: String, available: Vec<String> },

    /// The tool is outside the caller's allowed set, or inside the
    /// restricted set.
    #[error("tool not permitted: {0}")]
    NotPermitted(String),

    /// The user (or policy) denied the invocation.
    #[error("tool denied: {0}")]
    Denied(String),

    /// The caller's abort signal fired during invocation.
    #[error("tool invocation aborted")]
    Aborted,

    /// The per-call deadline elapsed.
    #[error("tool invocation timed out after {0} ms")]
    DeadlineElapsed(u64),

    /// The arguments failed schema-level validation.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The tool itself failed.
    #[error("tool failed: {0}")]
    Invocation(String),
}

impl Kinded for ToolError {
    fn kind(&self) -> ErrorKind {
        match self {
            ToolError::NotFound { .. } | ToolError::InvalidArgs(_) => ErrorKind::Validation,
            ToolError::NotPermitted(_) | ToolError::Denied(_) => ErrorKind::Permission,
            ToolError::Aborted | ToolError::DeadlineElapsed(_) => ErrorKind::Timeout,
            ToolError::Invocation(_) => ErrorKind::Tool,
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

// ---------------------------------------------------------------------------
// ToolOutcome
// ---------------------------------------------------------------------------

/// Uniform result shape every tool returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// The uniform tool contract.
///
/// Implementations declare a name, a human description (used to seed the
/// system prompt), a JSON-Schema-like parameter shape, and a sensitivity
/// hint the approval gate may consult. `invoke` receives the caller's abort
/// signal and permission envelope; the registry enforces the envelope before
/// invocation, tools may consult it for finer-grained decisions.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameter_schema(&self) -> serde_json::Value;

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::Medium
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        abort: AbortSignal,
        permissions: &ToolPermissions,
    ) -> Result<ToolOutcome>;
}

/// Pull a required string argument out of a JSON object.
pub fn require_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArgs(format!("missing required parameter: {key}")))
}
