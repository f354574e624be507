use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use fc_bridge::event_bus::EventBus;
use fc_bridge::protocol::MonitorEvent;
use fc_core::abort::{AbortHandle, AbortSignal};
use fc_core::config::AgentLimits;
use fc_core::error::{ErrorKind, Kinded};
use fc_core::types::{
    AgentKind, AgentStatus, FilesystemAccess, MiniAgentTask, TaskPriority, ToolPermissions,
};

use crate::lifecycle::{LifecycleManager, SweepAction};

/// Security-policy ceiling on tool calls per mini-agent.
pub const POLICY_MAX_TOOL_CALLS: u32 = 25;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("invalid task: {0}")]
    Validation(String),
    #[error("agent queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("mini-agents cannot spawn children")]
    DepthExceeded,
}

impl Kinded for SpawnError {
    fn kind(&self) -> ErrorKind {
        match self {
            SpawnError::Validation(_) | SpawnError::DepthExceeded => ErrorKind::Validation,
            SpawnError::QueueFull { .. } => ErrorKind::Budget,
        }
    }
}

pub type Result<T> = std::result::Result<T, SpawnError>;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Per-kind defaults: prompt prefix, tool set, permission posture.
#[derive(Debug, Clone)]
pub struct AgentTemplate {
    pub kind: AgentKind,
    pub prompt_prefix: &'static str,
    pub default_tools: &'static [&'static str],
    pub read_only: bool,
    pub max_iterations: u32,
    pub max_tool_calls: u32,
    /// Completion cap per model call for this agent kind.
    pub max_tokens: u32,
}

impl AgentTemplate {
    pub fn for_kind(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Search => Self {
                kind,
                prompt_prefix: "Locate relevant code and report findings.",
                default_tools: &["read_file", "search_files", "list_directory"],
                read_only: true,
                max_iterations: 4,
                max_tool_calls: 15,
                max_tokens: 8_000,
            },
            AgentKind::Migration => Self {
                kind,
                prompt_prefix: "Apply the described migration across the named files.",
                default_tools: &["read_file", "write_file", "search_files", "list_directory"],
                read_only: false,
                max_iterations: 6,
                max_tool_calls: 25,
                max_tokens: 15_000,
            },
            AgentKind::Analysis => Self {
                kind,
                prompt_prefix: "Analyze the named code and summarize structure and risks.",
                default_tools: &["read_file", "search_files", "list_directory"],
                read_only: true,
                max_iterations: 4,
                max_tool_calls: 15,
                max_tokens: 8_000,
            },
            AgentKind::Refactor => Self {
                kind,
                prompt_prefix: "Refactor the named code without changing behavior.",
                default_tools: &["read_file", "write_file", "search_files"],
                read_only: false,
                max_iterations: 6,
                max_tool_calls: 25,
                max_tokens: 15_000,
            },
            AgentKind::Test => Self {
                kind,
                prompt_prefix: "Write or run tests for the described behavior.",
                default_tools: &["read_file", "write_file", "shell", "search_files"],
                read_only: false,
                max_iterations: 6,
                max_tool_calls: 20,
                max_tokens: 12_000,
            },
            AgentKind::Documentation => Self {
                kind,
                prompt_prefix: "Write documentation for the named code.",
                default_tools: &["read_file", "write_file", "search_files"],
                read_only: false,
                max_iterations: 4,
                max_tool_calls: 15,
                max_tokens: 8_000,
            },
            AgentKind::General => Self {
                kind,
                prompt_prefix: "Complete the described task.",
                default_tools: &["read_file", "write_file", "search_files", "list_directory"],
                read_only: false,
                max_iterations: 5,
                max_tool_calls: 20,
                max_tokens: 12_000,
            },
        }
    }

    pub fn permissions(&self) -> ToolPermissions {
        ToolPermissions {
            allowed: self.default_tools.iter().map(|s| s.to_string()).collect(),
            restricted: Default::default(),
            read_only: self.read_only,
            network_access: false,
            filesystem_access: if self.read_only {
                FilesystemAccess::Read
            } else {
                FilesystemAccess::Write
            },
            dangerous_operations: false,
            git_operations: false,
            max_tool_calls: self.max_tool_calls,
        }
    }
}

/// Merge template defaults with the caller's request: always the
/// intersection, with the policy ceiling applied last.
pub fn merge_permissions(template: &AgentTemplate, requested: &ToolPermissions) -> ToolPermissions {
    let mut merged = template.permissions().intersect(requested);
    merged.max_tool_calls = merged
        .max_tool_calls
        .min(template.max_tool_calls)
        .min(POLICY_MAX_TOOL_CALLS);
    merged
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

/// Runs one scoped agent to completion. Production wiring instantiates an
/// orchestrator in scoped mode and calls `execute_as_agent`; tests inject a
/// stub.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        task: MiniAgentTask,
        abort: AbortSignal,
    ) -> std::result::Result<String, String>;
}

// ---------------------------------------------------------------------------
// Spawner
// ---------------------------------------------------------------------------

struct ActiveAgent {
    abort: AbortHandle,
    kind: AgentKind,
}

struct SpawnerInner {
    active: HashMap<Uuid, ActiveAgent>,
    queue: VecDeque<MiniAgentTask>,
    /// Every mini-agent id ever spawned; used to refuse depth > 1.
    known_agents: HashSet<Uuid>,
}

/// Parent-governed pool of mini-agents: validation, permission merging,
/// bounded queue with priority order, and lifecycle enforcement.
#[derive(Clone)]
pub struct MiniAgentSpawner {
    limits: AgentLimits,
    runner: Arc<dyn AgentRunner>,
    bus: EventBus,
    lifecycle: Arc<LifecycleManager>,
    inner: Arc<Mutex<SpawnerInner>>,
}

/// What `submit` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnTicket {
    Started,
    Queued { position: usize },
}

impl MiniAgentSpawner {
    pub fn new(
        limits: AgentLimits,
        runner: Arc<dyn AgentRunner>,
        bus: EventBus,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            limits,
            runner,
            bus,
            lifecycle,
            inner: Arc::new(Mutex::new(SpawnerInner {
                active: HashMap::new(),
                queue: VecDeque::new(),
                known_agents: HashSet::new(),
            })),
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Start the 1-second queue processor. Runs until the process exits.
    pub fn start_queue_processor(&self) {
        let spawner = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                spawner.tick().await;
            }
        });
    }

    /// Validate, merge permissions, and either start or enqueue the task.
    pub async fn submit(&self, mut task: MiniAgentTask) -> Result<SpawnTicket> {
        if task.prompt.trim().is_empty() {
            return Err(SpawnError::Validation("prompt is empty".into()));
        }
        if task.timeout_ms == 0 {
            return Err(SpawnError::Validation("timeout must be positive".into()));
        }
        if task.max_iterations == 0 {
            return Err(SpawnError::Validation(
                "max_iterations must be positive".into(),
            ));
        }

        let template = AgentTemplate::for_kind(task.kind);
        task.permissions = merge_permissions(&template, &task.permissions);
        if task.permissions.allowed.is_empty() {
            return Err(SpawnError::Validation(
                "no tools remain after permission merge".into(),
            ));
        }
        task.prompt = format!("{}\n\n{}", template.prompt_prefix, task.prompt);

        let mut inner = self.inner.lock().await;
        // Depth limit: a task whose parent is itself a mini-agent is refused.
        if inner.known_agents.contains(&task.parent_id) {
            return Err(SpawnError::DepthExceeded);
        }

        if inner.active.len() < self.limits.max_concurrent {
            inner.known_agents.insert(task.id);
            self.launch(&mut inner, task);
            Ok(SpawnTicket::Started)
        } else {
            if inner.queue.len() >= self.limits.queue_size {
                return Err(SpawnError::QueueFull {
                    capacity: self.limits.queue_size,
                });
            }
            inner.known_agents.insert(task.id);
            let position = enqueue_by_priority(&mut inner.queue, task);
            Ok(SpawnTicket::Queued { position })
        }
    }

    fn launch(&self, inner: &mut SpawnerInner, task: MiniAgentTask) {
        let (abort_handle, abort_signal) = AbortHandle::new();
        let task_id = task.id;
        let kind = task.kind;

        inner.active.insert(
            task_id,
            ActiveAgent {
                abort: abort_handle,
                kind,
            },
        );
        self.lifecycle.register(task_id, kind);
        self.bus.publish(MonitorEvent::AgentSpawned {
            agent_id: task_id,
            parent_id: task.parent_id,
            kind,
        });

        let spawner = self.clone();
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            // Heartbeat alongside the running agent.
            let heartbeat = {
                let lifecycle = Arc::clone(&spawner.lifecycle);
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(1));
                    loop {
                        interval.tick().await;
                        lifecycle.heartbeat(task_id);
                    }
                })
            };

            let timeout = Duration::from_millis(task.timeout_ms);
            let outcome =
                tokio::time::timeout(timeout, runner.run(task, abort_signal.clone())).await;
            heartbeat.abort();

            let status = match outcome {
                Ok(Ok(result)) => {
                    spawner.bus.publish(MonitorEvent::AgentProgress {
                        agent_id: task_id,
                        message: result,
                    });
                    AgentStatus::Completed
                }
                Ok(Err(error)) => {
                    warn!(agent = %task_id, error, "agent failed");
                    AgentStatus::Failed
                }
                Err(_) => AgentStatus::Timeout,
            };
            let status = if abort_signal.is_aborted() && status != AgentStatus::Completed {
                AgentStatus::Cancelled
            } else {
                status
            };

            spawner.cleanup(task_id, status).await;
        });
    }

    /// Cleanup after a terminal state: drop the active entry, record final
    /// metrics, emit the completion event, and pull queued work.
    async fn cleanup(&self, task_id: Uuid, status: AgentStatus) {
        {
            let mut inner = self.inner.lock().await;
            inner.active.remove(&task_id);
        }
        self.lifecycle.finish(task_id, status);
        self.bus.publish(MonitorEvent::AgentCompleted {
            agent_id: task_id,
            status,
        });
        self.pump_queue().await;
    }

    /// Pull queued tasks while slots are free (priority order, FIFO within).
    async fn pump_queue(&self) {
        let mut inner = self.inner.lock().await;
        while inner.active.len() < self.limits.max_concurrent {
            let Some(task) = inner.queue.pop_front() else {
                break;
            };
            info!(agent = %task.id, "starting queued agent");
            self.launch(&mut inner, task);
        }
    }

    /// Periodic maintenance: enforce lifecycle sweep decisions, then pump
    /// the queue.
    pub async fn tick(&self) {
        for action in self.lifecycle.sweep() {
            match action {
                SweepAction::TimeOut(task_id) => {
                    warn!(agent = %task_id, "agent heartbeat stale, timing out");
                    self.abort_agent(task_id, AgentStatus::Timeout).await;
                }
                SweepAction::ForceTerminate(task_id) => {
                    warn!(agent = %task_id, "agent critically unhealthy, force terminating");
                    self.abort_agent(task_id, AgentStatus::Failed).await;
                }
                SweepAction::Pruned(_) => {}
            }
        }
        self.pump_queue().await;
    }

    async fn abort_agent(&self, task_id: Uuid, status: AgentStatus) {
        let aborted = {
            let inner = self.inner.lock().await;
            match inner.active.get(&task_id) {
                Some(agent) => {
                    agent.abort.abort();
                    true
                }
                None => false,
            }
        };
        if aborted {
            self.cleanup(task_id, status).await;
        }
    }

    /// Parent abort: best-effort cancel of every child, queue cleared.
    pub async fn cancel_all(&self) {
        let (active_ids, queued): (Vec<Uuid>, Vec<MiniAgentTask>) = {
            let mut inner = self.inner.lock().await;
            let ids = inner.active.keys().copied().collect();
            let queued = inner.queue.drain(..).collect();
            (ids, queued)
        };
        for task in queued {
            self.lifecycle.register(task.id, task.kind);
            self.lifecycle.finish(task.id, AgentStatus::Cancelled);
            self.bus.publish(MonitorEvent::AgentCompleted {
                agent_id: task.id,
                status: AgentStatus::Cancelled,
            });
        }
        for task_id in active_ids {
            self.abort_agent(task_id, AgentStatus::Cancelled).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn active_kinds(&self) -> Vec<AgentKind> {
        self.inner
            .lock()
            .await
            .active
            .values()
            .map(|a| a.kind)
            .collect()
    }
}

/// Insert keeping priority order (high > normal > low), FIFO within a
/// priority level. Returns the queue position.
fn enqueue_by_priority(queue: &mut VecDeque<MiniAgentTask>, task: MiniAgentTask) -> usize {
    let position = queue
        .iter()
        .position(|queued| queued.priority < task.priority)
        .unwrap_or(queue.len());
    queue.insert(position, task);
    position
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::types::ScopedContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRunner {
        delay: Duration,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl AgentRunner for StubRunner {
        async fn run(
            &self,
            _task: MiniAgentTask,
            mut abort: AbortSignal,
        ) -> std::result::Result<String, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = abort.aborted() => return Err("aborted".into()),
            }
            if self.fail {
                Err("stub failure".into())
            } else {
                Ok("stub done".into())
            }
        }
    }

    fn task(kind: AgentKind, priority: TaskPriority) -> MiniAgentTask {
        MiniAgentTask {
            id: Uuid::new_v4(),
            parent_id: Uuid::new_v4(),
            kind,
            prompt: "do the thing".into(),
            scoped_context: ScopedContext::default(),
            permissions: ToolPermissions::unrestricted(
                ["read_file", "write_file", "search_files", "list_directory", "shell"]
                    .iter()
                    .map(|s| s.to_string()),
            ),
            max_iterations: 3,
            timeout_ms: 5_000,
            priority,
        }
    }

    fn spawner(max_concurrent: usize, queue_size: usize, delay_ms: u64) -> (MiniAgentSpawner, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let spawner = MiniAgentSpawner::new(
            AgentLimits {
                max_concurrent,
                queue_size,
                default_timeout_ms: 5_000,
                max_retries: 2,
            },
            Arc::new(StubRunner {
                delay: Duration::from_millis(delay_ms),
                runs: Arc::clone(&runs),
                fail: false,
            }),
            EventBus::new(),
            Arc::new(LifecycleManager::default()),
        );
        (spawner, runs)
    }

    #[tokio::test]
    async fn under_capacity_starts_immediately() {
        let (spawner, runs) = spawner(2, 10, 10);
        let ticket = spawner.submit(task(AgentKind::Search, TaskPriority::Normal)).await.unwrap();
        assert_eq!(ticket, SpawnTicket::Started);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(spawner.active_count().await, 0);
    }

    #[tokio::test]
    async fn over_capacity_queues_and_drains() {
        let (spawner, runs) = spawner(1, 10, 30);
        spawner.submit(task(AgentKind::Search, TaskPriority::Normal)).await.unwrap();
        let ticket = spawner
            .submit(task(AgentKind::Analysis, TaskPriority::Normal))
            .await
            .unwrap();
        assert!(matches!(ticket, SpawnTicket::Queued { .. }));
        assert_eq!(spawner.queued_count().await, 1);

        // Completion of the first pulls the second without waiting for tick.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(spawner.queued_count().await, 0);
    }

    #[tokio::test]
    async fn full_queue_is_a_typed_error_with_no_state_change() {
        let (spawner, _) = spawner(1, 1, 200);
        spawner.submit(task(AgentKind::Search, TaskPriority::Normal)).await.unwrap();
        spawner.submit(task(AgentKind::Search, TaskPriority::Normal)).await.unwrap();

        let before = spawner.queued_count().await;
        let err = spawner
            .submit(task(AgentKind::Search, TaskPriority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::QueueFull { capacity: 1 }));
        assert_eq!(spawner.queued_count().await, before);
    }

    #[tokio::test]
    async fn priority_order_high_before_normal_fifo_within() {
        let (spawner, _) = spawner(1, 10, 100);
        spawner.submit(task(AgentKind::General, TaskPriority::Normal)).await.unwrap();

        let normal_a = task(AgentKind::Search, TaskPriority::Normal);
        let normal_b = task(AgentKind::Search, TaskPriority::Normal);
        let high = task(AgentKind::Search, TaskPriority::High);
        let low = task(AgentKind::Search, TaskPriority::Low);
        let (na, nb, hi, lo) = (normal_a.id, normal_b.id, high.id, low.id);

        spawner.submit(normal_a).await.unwrap();
        spawner.submit(low).await.unwrap();
        spawner.submit(normal_b).await.unwrap();
        spawner.submit(high).await.unwrap();

        let inner = spawner.inner.lock().await;
        let order: Vec<Uuid> = inner.queue.iter().map(|t| t.id).collect();
        assert_eq!(order, vec![hi, na, nb, lo]);
    }

    #[tokio::test]
    async fn depth_limit_refuses_agent_children() {
        let (spawner, _) = spawner(2, 10, 100);
        let parent_task = task(AgentKind::General, TaskPriority::Normal);
        let parent_agent_id = parent_task.id;
        spawner.submit(parent_task).await.unwrap();

        let mut child = task(AgentKind::Search, TaskPriority::Normal);
        child.parent_id = parent_agent_id;
        let err = spawner.submit(child).await.unwrap_err();
        assert!(matches!(err, SpawnError::DepthExceeded));
    }

    #[tokio::test]
    async fn validation_rejects_bad_tasks() {
        let (spawner, _) = spawner(2, 10, 10);

        let mut empty_prompt = task(AgentKind::Search, TaskPriority::Normal);
        empty_prompt.prompt = "  ".into();
        assert!(matches!(
            spawner.submit(empty_prompt).await,
            Err(SpawnError::Validation(_))
        ));

        let mut zero_timeout = task(AgentKind::Search, TaskPriority::Normal);
        zero_timeout.timeout_ms = 0;
        assert!(matches!(
            spawner.submit(zero_timeout).await,
            Err(SpawnError::Validation(_))
        ));

        let mut no_tools = task(AgentKind::Search, TaskPriority::Normal);
        no_tools.permissions.allowed.clear();
        assert!(matches!(
            spawner.submit(no_tools).await,
            Err(SpawnError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn permissions_are_intersected_with_template() {
        let template = AgentTemplate::for_kind(AgentKind::Search);
        let requested = ToolPermissions {
            allowed: ["read_file", "shell", "web_search"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_tool_calls: 100,
            ..ToolPermissions::default()
        };
        let merged = merge_permissions(&template, &requested);

        // Search template has no shell/web_search; intersection drops them.
        assert!(merged.allowed.contains("read_file"));
        assert!(!merged.allowed.contains("shell"));
        assert!(!merged.allowed.contains("web_search"));
        assert!(merged.read_only);
        // min(caller 100, template 15, policy 25) = 15.
        assert_eq!(merged.max_tool_calls, 15);
        assert!(merged.allowed.is_disjoint(&merged.restricted));
    }

    #[tokio::test]
    async fn cancel_all_aborts_children_and_clears_queue() {
        let (spawner, _) = spawner(1, 10, 5_000);
        spawner.submit(task(AgentKind::General, TaskPriority::Normal)).await.unwrap();
        spawner.submit(task(AgentKind::Search, TaskPriority::Normal)).await.unwrap();
        assert_eq!(spawner.active_count().await, 1);
        assert_eq!(spawner.queued_count().await, 1);

        spawner.cancel_all().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spawner.active_count().await, 0);
        assert_eq!(spawner.queued_count().await, 0);
    }

    #[tokio::test]
    async fn timeout_status_on_slow_runner() {
        let (spawner, _) = spawner(1, 10, 10_000);
        let mut slow = task(AgentKind::General, TaskPriority::Normal);
        slow.timeout_ms = 30;
        let id = slow.id;
        spawner.submit(slow).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = spawner.lifecycle().get(id).unwrap();
        assert_eq!(record.status, AgentStatus::Timeout);
        // Cleanup completeness: no references remain in the active set.
        assert_eq!(spawner.active_count().await, 0);
    }
}
