use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use fc_bridge::event_bus::EventBus;
use fc_bridge::protocol::MonitorEvent;
use fc_core::abort::AbortSignal;
use fc_core::budget::{ModeBudget, TokenBudgetManager};
use fc_core::error::{ErrorKind, Kinded};
use fc_core::store::{SessionStore, StoreError};
use fc_core::types::{Mode, ScopedContext, Session, SessionStatus, ToolPermissions};
use fc_memory::layers::{MemoryError, MemoryLayers};
use fc_memory::vector::SearchFilters;
use fc_model::client::RateLimitedClient;
use fc_model::provider::{collect_stream, ChatMessage, ChatOptions, ModelError};
use fc_tools::registry::ToolRegistry;

use crate::executor::{ExecutedCall, Executor, ExecutorError};
use crate::planner::Planner;
use crate::segments::{answer_text, segment_response, tool_calls};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl Kinded for OrchestratorError {
    fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Memory(e) => e.kind(),
            OrchestratorError::Model(e) => e.kind(),
            OrchestratorError::Store(e) => e.kind(),
            OrchestratorError::Executor(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Config / state / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Reason-act loop cap per (sub-)turn.
    pub max_iterations: usize,
    /// Per-tool-call deadline.
    pub tool_deadline_ms: u64,
    /// Whether complex prompts go through the planner.
    pub enable_planner: bool,
    /// Base system prompt; tool descriptions are appended on turn zero.
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            tool_deadline_ms: 60_000,
            enable_planner: true,
            system_prompt: "You are a local coding assistant. Use the available tools \
                            to inspect and modify the workspace; answer directly when \
                            no tool is needed."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Planning,
    Executing,
    AwaitingApproval,
    Aborting,
}

/// What one user turn produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub answer: String,
    pub iterations: usize,
    pub tool_calls: usize,
    /// The turn stopped early on user abort.
    pub aborted: bool,
    /// The answer is incomplete (abort or iteration cap).
    pub partial: bool,
    /// A tool was denied; the turn ended with a user-visible message.
    pub denied: bool,
}

impl TurnOutcome {
    fn answer_only(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            iterations: 0,
            tool_calls: 0,
            aborted: false,
            partial: false,
            denied: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Owns the bounded reason-act loop and wires memory, the model client, the
/// executor, and the session store together for each turn.
pub struct Orchestrator {
    config: OrchestratorConfig,
    project_id: String,
    store: Arc<SessionStore>,
    memory: MemoryLayers,
    client: Arc<RateLimitedClient>,
    model: String,
    registry: Arc<ToolRegistry>,
    executor: Executor,
    planner: Planner,
    bus: EventBus,
    permissions: ToolPermissions,
    filters: SearchFilters,
    mode: Mode,
    state: OrchestratorState,
    session: Option<Session>,
    session_tokens: u64,
    turn_count: u32,
    last_retrieval_ids: Vec<String>,
    /// Output clamp applied when running as a scoped mini-agent.
    agent_max_tokens: Option<u32>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        project_id: impl Into<String>,
        store: Arc<SessionStore>,
        memory: MemoryLayers,
        client: Arc<RateLimitedClient>,
        model: impl Into<String>,
        registry: Arc<ToolRegistry>,
        executor: Executor,
        bus: EventBus,
        permissions: ToolPermissions,
        mode: Mode,
    ) -> Self {
        let executor =
            executor.with_tool_deadline(Duration::from_millis(config.tool_deadline_ms));
        Self {
            config,
            project_id: project_id.into(),
            store,
            memory,
            client,
            model: model.into(),
            registry,
            executor,
            planner: Planner::new(30_000),
            bus,
            permissions,
            filters: SearchFilters::default(),
            mode,
            state: OrchestratorState::Idle,
            session: None,
            session_tokens: 0,
            turn_count: 0,
            last_retrieval_ids: Vec::new(),
            agent_max_tokens: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut MemoryLayers {
        &mut self.memory
    }

    /// Resume from a crashed session's snapshot: restore ephemeral state
    /// and continue turn numbering from where it stopped.
    pub async fn seed_from_snapshot(&mut self, crashed: &Session) -> Result<bool> {
        let Some(snapshot) = self.store.restore_latest(crashed.id).await? else {
            return Ok(false);
        };
        if let Ok(state) =
            serde_json::from_value::<fc_memory::ephemeral::EphemeralState>(
                snapshot.ephemeral_state.clone(),
            )
        {
            self.memory.restore_ephemeral(state);
        }
        self.mode = snapshot.mode;
        self.turn_count = crashed.turn_count;
        info!(
            crashed_session = %crashed.id,
            sequence = snapshot.sequence,
            "seeded memory from crash snapshot"
        );
        Ok(true)
    }

    async fn ensure_session(&mut self) -> Result<Session> {
        if let Some(ref session) = self.session {
            return Ok(session.clone());
        }
        let session = match self.store.active_session(&self.project_id).await? {
            Some(existing) => existing,
            None => self.store.start_session(&self.project_id, self.mode).await?,
        };
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Close the current session.
    pub async fn end_session(&mut self, status: SessionStatus) -> Result<()> {
        if let Some(session) = self.session.take() {
            self.store
                .end_session(session.id, status, self.turn_count, self.session_tokens)
                .await?;
            self.bus.publish(MonitorEvent::SessionEnded {
                session_id: session.id,
                status,
            });
        }
        self.state = OrchestratorState::Idle;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Turn entry points
    // -----------------------------------------------------------------------

    /// Run one full user turn: optional plan decomposition, then the
    /// reason-act loop (per sub-task when decomposed).
    pub async fn run_turn(&mut self, query: &str, abort: AbortSignal) -> Result<TurnOutcome> {
        if query.trim().is_empty() {
            return Ok(TurnOutcome::answer_only("Nothing to do."));
        }

        let session = self.ensure_session().await?;
        self.turn_count += 1;
        self.bus.publish(MonitorEvent::TurnStarted {
            session_id: session.id,
            turn: self.turn_count,
        });
        self.store.bump_counter("turns", 1).await?;

        let outcome = if self.config.enable_planner {
            self.state = OrchestratorState::Planning;
            let plan = self.planner.decompose(query);
            if plan.len() > 1 {
                debug!(tasks = plan.len(), "running decomposed turn");
                self.run_planned(query, plan, abort).await
            } else {
                self.reason_act(query, abort).await
            }
        } else {
            self.reason_act(query, abort).await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state = OrchestratorState::Idle;
                self.bus.publish(MonitorEvent::Error {
                    source: "orchestrator".into(),
                    kind: format!("{:?}", err.kind()),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        self.store
            .touch_session(session.id, self.turn_count, self.session_tokens)
            .await?;
        if let Some(ref mut cached) = self.session {
            cached.turn_count = self.turn_count;
            cached.tokens_used = self.session_tokens;
        }
        self.snapshot(Some(query.to_string())).await?;
        self.bus.publish(MonitorEvent::TurnComplete {
            session_id: session.id,
            turn: self.turn_count,
            tokens_used: self.session_tokens,
        });
        self.state = OrchestratorState::Idle;

        if outcome.aborted {
            // Aborting drains in-flight work and completes the session with
            // a partial-result marker.
            self.end_session(SessionStatus::Completed).await?;
        }
        Ok(outcome)
    }

    /// The scoped entry point used by the mini-agent spawner: same loop,
    /// memory reads narrowed to the scope, permissions enforced per call,
    /// completion output clamped to `max_tokens`.
    pub async fn execute_as_agent(
        &mut self,
        prompt: &str,
        scope: ScopedContext,
        permissions: ToolPermissions,
        max_tokens: u32,
        timeout_ms: u64,
        abort: AbortSignal,
    ) -> Result<TurnOutcome> {
        self.permissions = permissions;
        self.filters = SearchFilters {
            focus_files: scope.relevant_files.clone(),
            path_glob: scope.search_patterns.first().cloned(),
            ..Default::default()
        };
        self.config.enable_planner = false;
        self.agent_max_tokens = Some(max_tokens);

        let run = self.run_turn(prompt, abort);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.state = OrchestratorState::Idle;
                Err(OrchestratorError::Model(ModelError::Timeout))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Planned execution
    // -----------------------------------------------------------------------

    async fn run_planned(
        &mut self,
        query: &str,
        plan: crate::planner::Plan,
        abort: AbortSignal,
    ) -> Result<TurnOutcome> {
        let mut answers = Vec::new();
        let mut total_calls = 0;
        let mut iterations = 0;
        let order: Vec<String> = plan
            .execution_order()
            .iter()
            .map(|t| t.description.clone())
            .collect();

        for description in order {
            if abort.is_aborted() {
                return Ok(TurnOutcome {
                    answer: answers.join("\n"),
                    iterations,
                    tool_calls: total_calls,
                    aborted: true,
                    partial: true,
                    denied: false,
                });
            }
            let sub_query = format!("{description}\n(part of: {query})");
            let sub = self.reason_act(&sub_query, abort.clone()).await?;
            iterations += sub.iterations;
            total_calls += sub.tool_calls;
            let denied = sub.denied;
            if !sub.answer.is_empty() {
                answers.push(sub.answer);
            }
            if denied {
                return Ok(TurnOutcome {
                    answer: answers.join("\n"),
                    iterations,
                    tool_calls: total_calls,
                    aborted: false,
                    partial: true,
                    denied: true,
                });
            }
        }

        Ok(TurnOutcome {
            answer: answers.join("\n"),
            iterations,
            tool_calls: total_calls,
            aborted: false,
            partial: false,
            denied: false,
        })
    }

    // -----------------------------------------------------------------------
    // The reason-act loop
    // -----------------------------------------------------------------------

    async fn reason_act(&mut self, query: &str, abort: AbortSignal) -> Result<TurnOutcome> {
        let session = self.ensure_session().await?;
        let mut conversation: Vec<ChatMessage> = vec![ChatMessage::user(query)];
        let mut calls_remaining = self.permissions.max_tool_calls;
        let mut total_calls = 0usize;
        self.memory
            .record_turn("user", query, query.len().div_ceil(4));

        for iteration in 0..self.config.max_iterations {
            if abort.is_aborted() {
                self.state = OrchestratorState::Aborting;
                return Ok(TurnOutcome {
                    answer: String::new(),
                    iterations: iteration,
                    tool_calls: total_calls,
                    aborted: true,
                    partial: true,
                    denied: false,
                });
            }

            // Assemble the bounded prompt. A budget failure here surfaces
            // before any provider call.
            let mut budget = TokenBudgetManager::new(self.mode);
            let system_prompt = if self.turn_count <= 1 && iteration == 0 {
                format!(
                    "{}\n\nAvailable tools:\n{}",
                    self.config.system_prompt,
                    self.registry.descriptions_block(),
                )
            } else {
                self.config.system_prompt.clone()
            };
            let parts = self
                .memory
                .build_prompt(&system_prompt, query, &mut budget, &self.filters)
                .await?;

            self.last_retrieval_ids = parts.retrieval_ids.clone();
            self.bus.publish(MonitorEvent::Retrieval {
                session_id: session.id,
                chunks: parts.retrieval_ids.len(),
                degraded: parts.degraded_retrieval,
            });
            let report = budget.report();
            self.bus.publish(MonitorEvent::BudgetReport {
                session_id: session.id,
                report: serde_json::to_value(&report).unwrap_or_default(),
            });

            let mode_output = ModeBudget::for_mode(self.mode).output as u32;
            let opts = ChatOptions {
                model: self.model.clone(),
                max_tokens: self
                    .agent_max_tokens
                    .map_or(mode_output, |cap| cap.min(mode_output)),
                temperature: 0.7,
                system: Some(format!("{}\n\n{}", parts.system, parts.context_block())),
            };

            let stream = match self
                .client
                .chat(
                    &conversation,
                    &opts,
                    report.input_used as u64,
                    abort.clone(),
                )
                .await
            {
                Ok(stream) => stream,
                Err(ModelError::Cancelled) => {
                    self.state = OrchestratorState::Aborting;
                    return Ok(TurnOutcome {
                        answer: String::new(),
                        iterations: iteration,
                        tool_calls: total_calls,
                        aborted: true,
                        partial: true,
                        denied: false,
                    });
                }
                Err(err) => return Err(err.into()),
            };
            let (text, usage) = collect_stream(stream).await?;

            self.session_tokens += usage.prompt_tokens + usage.completion_tokens;
            self.bus.publish(MonitorEvent::TokenUsage {
                session_id: session.id,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            });
            self.store
                .bump_counter("tokens_used", usage.prompt_tokens + usage.completion_tokens)
                .await?;

            let segments = segment_response(&text);
            let calls = tool_calls(&segments);
            let answer = answer_text(&segments);
            self.memory
                .record_turn("assistant", &answer, answer.len().div_ceil(4));

            if calls.is_empty() {
                debug!(iteration, "final answer, no tool calls");
                return Ok(TurnOutcome {
                    answer,
                    iterations: iteration + 1,
                    tool_calls: total_calls,
                    aborted: false,
                    partial: false,
                    denied: false,
                });
            }

            conversation.push(ChatMessage::assistant(text.clone()));
            self.state = OrchestratorState::AwaitingApproval;
            let results = match self
                .executor
                .execute_calls(
                    session.id,
                    &calls,
                    abort.clone(),
                    &self.permissions,
                    &mut calls_remaining,
                )
                .await
            {
                Ok(results) => results,
                Err(ExecutorError::Denied(reason)) => {
                    warn!(reason, "turn ended by denial");
                    return Ok(TurnOutcome {
                        answer: format!("operation denied: {reason}"),
                        iterations: iteration + 1,
                        tool_calls: total_calls,
                        aborted: false,
                        partial: false,
                        denied: true,
                    });
                }
                Err(ExecutorError::Aborted) => {
                    self.state = OrchestratorState::Aborting;
                    return Ok(TurnOutcome {
                        answer,
                        iterations: iteration + 1,
                        tool_calls: total_calls,
                        aborted: true,
                        partial: true,
                        denied: false,
                    });
                }
                Err(other) => return Err(other.into()),
            };
            self.state = OrchestratorState::Executing;
            total_calls += results.len();
            self.store
                .bump_counter("tool_calls", results.len() as u64)
                .await?;

            self.append_results(&mut conversation, &results);
            // Durable checkpoint after every successful tool-induced state
            // change.
            self.snapshot(Some(query.to_string())).await?;
        }

        warn!(max = self.config.max_iterations, "iteration cap reached");
        Ok(TurnOutcome {
            answer: "Reached the iteration limit before finishing; partial progress above."
                .to_string(),
            iterations: self.config.max_iterations,
            tool_calls: total_calls,
            aborted: false,
            partial: true,
            denied: false,
        })
    }

    fn append_results(&mut self, conversation: &mut Vec<ChatMessage>, results: &[ExecutedCall]) {
        for result in results {
            let message = result.as_message();
            self.memory
                .record_turn("tool", &message, message.len().div_ceil(4));
            conversation.push(ChatMessage::tool(message));
        }
    }

    async fn snapshot(&mut self, last_command: Option<String>) -> Result<()> {
        let Some(ref session) = self.session else {
            return Ok(());
        };
        let state = self.memory.ephemeral_state();
        let snapshot = self
            .store
            .snapshot(
                session.id,
                serde_json::to_value(&state).unwrap_or_default(),
                self.last_retrieval_ids.clone(),
                self.mode,
                serde_json::json!({ "mode": self.mode }),
                last_command,
            )
            .await?;
        self.bus.publish(MonitorEvent::Snapshot {
            session_id: session.id,
            sequence: snapshot.sequence,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
