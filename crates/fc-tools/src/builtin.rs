use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use fc_core::abort::AbortSignal;
use fc_core::types::{FilesystemAccess, Sensitivity, ToolPermissions};

use crate::contract::{require_str, Result, Tool, ToolError, ToolOutcome};
use crate::registry::ToolRegistry;

// ---------------------------------------------------------------------------
// Built-in tool set
//
// Always-registered core tools: read_file, write_file, list_directory,
// search_files, shell. Anything richer (web search, editor bridges) arrives
// through the same Tool contract from outside the core.
// ---------------------------------------------------------------------------

/// Register the built-in tools rooted at `workspace`.
pub fn register_builtin_tools(registry: &mut ToolRegistry, workspace: impl Into<PathBuf>) {
    let workspace = workspace.into();
    registry.register(Arc::new(ReadFileTool {
        root: workspace.clone(),
    }));
    registry.register(Arc::new(WriteFileTool {
        root: workspace.clone(),
    }));
    registry.register(Arc::new(ListDirectoryTool {
        root: workspace.clone(),
    }));
    registry.register(Arc::new(SearchFilesTool {
        root: workspace.clone(),
    }));
    registry.register(Arc::new(ShellTool { root: workspace }));
}

fn resolve(root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the workspace" }
            },
            "required": ["path"]
        })
    }

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::None
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        _abort: AbortSignal,
        _permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        let path = resolve(&self.root, require_str(&args, "path")?);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolOutcome::ok(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ToolOutcome::fail(
                format!("file not found: {}", path.display()),
            )),
            Err(e) => Ok(ToolOutcome::fail(format!("read failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        _abort: AbortSignal,
        permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        if permissions.read_only || permissions.filesystem_access != FilesystemAccess::Write {
            return Err(ToolError::NotPermitted(
                "write access is not granted".into(),
            ));
        }
        let path = resolve(&self.root, require_str(&args, "path")?);
        let content = require_str(&args, "content")?;

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolOutcome::fail(format!("mkdir failed: {e}")));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => Ok(ToolOutcome::ok(format!(
                "wrote {} bytes to {}",
                content.len(),
                path.display(),
            ))),
            Err(e) => Ok(ToolOutcome::fail(format!("write failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

pub struct ListDirectoryTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path; defaults to the workspace root" }
            }
        })
    }

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::None
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        _abort: AbortSignal,
        _permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| resolve(&self.root, p))
            .unwrap_or_else(|| self.root.clone());

        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return Ok(ToolOutcome::fail(format!("list failed: {e}"))),
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push(format!("{kind}  {}", entry.file_name().to_string_lossy()));
        }
        entries.sort();
        Ok(ToolOutcome::ok(entries.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// search_files
// ---------------------------------------------------------------------------

pub struct SearchFilesTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search workspace files for a substring, returning path:line matches."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "max_results": { "type": "integer", "minimum": 1, "maximum": 500 }
            },
            "required": ["pattern"]
        })
    }

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::None
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        abort: AbortSignal,
        _permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        let pattern = require_str(&args, "pattern")?.to_string();
        let max_results = args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;
        let root = self.root.clone();

        let matches = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                if abort.is_aborted() || out.len() >= max_results {
                    break;
                }
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name();
                    // Skip VCS and state directories.
                    if name == ".git" || name == ".flexicli" || name == "target" {
                        continue;
                    }
                    if path.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let Ok(content) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    for (i, line) in content.lines().enumerate() {
                        if line.contains(&pattern) {
                            let rel = path.strip_prefix(&root).unwrap_or(&path);
                            out.push(format!("{}:{}: {}", rel.display(), i + 1, line.trim()));
                            if out.len() >= max_results {
                                break;
                            }
                        }
                    }
                }
            }
            out
        })
        .await
        .map_err(|e| ToolError::Invocation(e.to_string()))?;

        debug!(matches = matches.len(), "search_files complete");
        Ok(ToolOutcome::ok(matches.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// shell
// ---------------------------------------------------------------------------

pub struct ShellTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its output."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" }
            },
            "required": ["command"]
        })
    }

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::High
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        mut abort: AbortSignal,
        permissions: &ToolPermissions,
    ) -> Result<ToolOutcome> {
        let command = require_str(&args, "command")?;
        if permissions.read_only {
            return Err(ToolError::NotPermitted(
                "shell is unavailable in read-only mode".into(),
            ));
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Invocation(format!("spawn failed: {e}")))?;

        tokio::select! {
            result = child.wait_with_output() => {
                let output = result.map_err(|e| ToolError::Invocation(e.to_string()))?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    Ok(ToolOutcome::ok(stdout))
                } else {
                    Ok(ToolOutcome {
                        success: false,
                        output: stdout,
                        error: Some(if stderr.is_empty() {
                            format!("exit status {:?}", output.status.code())
                        } else {
                            stderr
                        }),
                    })
                }
            }
            _ = abort.aborted() => Err(ToolError::Aborted),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
