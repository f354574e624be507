use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use fc_core::abort::AbortSignal;
use fc_core::types::ToolPermissions;

use crate::contract::{Result, Tool, ToolError, ToolOutcome};

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Discovery and permission-filtered invocation over the registered tools.
///
/// Read-mostly: tools are registered at startup; lookups take `&self`.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools.push(tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Render name + description of every tool, used to seed the system
    /// prompt on turn zero.
    pub fn descriptions_block(&self) -> String {
        self.tools
            .iter()
            .map(|t| {
                format!(
                    "- {}: {}\n  parameters: {}",
                    t.name(),
                    t.description(),
                    t.parameter_schema(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Fuzzy lookup: case-insensitive, `_`/`-` equivalent, a trailing
    /// `Tool` suffix stripped, substring match as a last resort. On several
    /// candidates the highest-specificity match wins; on zero matches the
    /// error carries the full available list.
    pub fn find_by_name(&self, requested: &str) -> Result<Arc<dyn Tool>> {
        let wanted = normalize(requested);
        let wanted_stripped = strip_tool_suffix(&wanted);

        let mut best: Option<(u8, &Arc<dyn Tool>)> = None;
        for tool in &self.tools {
            let name = normalize(tool.name());
            let specificity = if name == wanted {
                3
            } else if strip_tool_suffix(&name) == wanted_stripped {
                2
            } else if name.contains(wanted_stripped) || wanted_stripped.contains(name.as_str()) {
                1
            } else {
                continue;
            };
            match best {
                Some((s, _)) if s >= specificity => {}
                _ => best = Some((specificity, tool)),
            }
        }

        match best {
            Some((specificity, tool)) => {
                debug!(requested, resolved = tool.name(), specificity, "tool lookup");
                Ok(Arc::clone(tool))
            }
            None => Err(ToolError::NotFound {
                name: requested.to_string(),
                available: self.names(),
            }),
        }
    }

    /// Invoke a tool under the permission envelope, racing the caller's
    /// abort signal against a per-call deadline; whichever fires first
    /// cancels the invocation.
    pub async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        mut abort: AbortSignal,
        deadline: Duration,
        permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        let tool = self.find_by_name(name)?;
        let resolved = tool.name().to_string();

        if !permissions.allowed.contains(&resolved) {
            return Err(ToolError::NotPermitted(format!(
                "{resolved} is not in the allowed set"
            )));
        }
        if permissions.restricted.contains(&resolved) {
            return Err(ToolError::NotPermitted(format!("{resolved} is restricted")));
        }

        tokio::select! {
            result = tokio::time::timeout(deadline, tool.invoke(args, abort.clone(), permissions)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ToolError::DeadlineElapsed(deadline.as_millis() as u64)),
                }
            }
            _ = abort.aborted() => Err(ToolError::Aborted),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

fn strip_tool_suffix(name: &str) -> &str {
    name.strip_suffix("_tool")
        .or_else(|| name.strip_suffix("tool"))
        .unwrap_or(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
