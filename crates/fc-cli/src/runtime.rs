use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use fc_agents::orchestrator::{Orchestrator, OrchestratorConfig, TurnOutcome};
use fc_agents::spawner::{AgentRunner, MiniAgentSpawner};
use fc_agents::lifecycle::{LifecycleConfig, LifecycleManager};
use fc_bridge::event_bus::EventBus;
use fc_bridge::monitor::{self, MonitorState};
use fc_bridge::protocol::MonitorEvent;
use fc_core::abort::{AbortHandle, AbortSignal};
use fc_core::budget::ModeBudget;
use fc_core::config::{Config, ConfigError};
use fc_core::logs::LogRotation;
use fc_core::project::{ProjectDirs, ProjectError};
use fc_core::store::{SessionStore, StoreError};
use fc_core::types::{MiniAgentTask, SessionStatus, ToolPermissions};
use fc_memory::embedding::{CachedEmbedder, EmbeddingProvider, HttpEmbedder};
use fc_memory::ephemeral::EphemeralMemory;
use fc_memory::git_context;
use fc_memory::layers::MemoryLayers;
use fc_model::client::RateLimitedClient;
use fc_model::provider::HttpChatProvider;
use fc_telemetry::metrics::MetricsCollector;
use fc_tools::approval::{ApprovalDecision, ApprovalGate, ConsolePrompt, StaticTransport};
use fc_tools::builtin::register_builtin_tools;
use fc_tools::registry::ToolRegistry;

// ---------------------------------------------------------------------------
// Errors / completion
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-level completion, mapped to exit codes in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Error,
    Aborted,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Everything wired together for one project: no globals, explicit
/// ownership, ordered shutdown.
pub struct Runtime {
    pub config: Config,
    pub dirs: ProjectDirs,
    pub store: Arc<SessionStore>,
    pub bus: EventBus,
    pub gate: Arc<ApprovalGate>,
    pub spawner: MiniAgentSpawner,
    pub orchestrator: tokio::sync::Mutex<Orchestrator>,
    monitor: Option<Arc<MonitorState>>,
}

impl Runtime {
    /// Bring the whole stack up: project layout, log rotation, monitoring,
    /// store (with crash recovery), memory index, git ingestion, tools,
    /// model client, orchestrator, and the mini-agent spawner.
    ///
    /// `interactive` selects the approval transport: a console prompt for
    /// the REPL, an auto-denying transport for non-interactive runs.
    pub async fn start(
        project_root: &str,
        config: Config,
        interactive: bool,
    ) -> Result<Self, StartupError> {
        let root = Path::new(project_root);
        let dirs = ProjectDirs::open(root, config.embedding.model_name.clone())?;

        if let Err(e) = LogRotation::new(dirs.logs_dir()).rotate() {
            warn!(error = %e, "log rotation failed");
        }

        let bus = EventBus::new();
        let metrics = Arc::new(MetricsCollector::new());
        let monitor_state = if config.monitoring.enabled {
            let state = MonitorState::new(bus.clone(), Arc::clone(&metrics));
            state.start_collector();
            monitor::serve(Arc::clone(&state), config.monitoring.port).await?;
            Some(state)
        } else {
            None
        };

        // The monitoring surface must stay reachable even when the store is
        // unreadable, so the error is published before it propagates.
        let store = match SessionStore::open(dirs.db_path()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                bus.publish(MonitorEvent::Error {
                    source: "session-store".into(),
                    kind: "corruption".into(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };
        if let Some(ref state) = monitor_state {
            state.attach_store(Arc::clone(&store)).await;
            if let Ok(meta) = dirs.read_meta() {
                state.register_project(meta).await;
            }
        }

        let crashed = store.recover_stale_sessions(&dirs.id).await?;
        for session in &crashed {
            warn!(session = %session.id, "previous session marked crashed");
        }

        match git_context::ingest_history(&dirs.root, &dirs.id, &store, git_context::MAX_COMMITS)
            .await
        {
            Ok(n) if n > 0 => info!(commits = n, "git history ingested"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "git ingestion failed"),
        }

        let embedder: Option<Arc<dyn EmbeddingProvider>> =
            HttpEmbedder::from_config(&config.embedding).map(|http| {
                Arc::new(CachedEmbedder::new(http, dirs.cache_dir()))
                    as Arc<dyn EmbeddingProvider>
            });

        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, &dirs.root);
        let registry = Arc::new(registry);
        let permissions = ToolPermissions::unrestricted(registry.names());

        let gate = if interactive {
            Arc::new(ApprovalGate::new(config.approval_mode, Arc::new(ConsolePrompt)))
        } else {
            Arc::new(ApprovalGate::new(
                config.approval_mode,
                Arc::new(StaticTransport(ApprovalDecision::Denied)),
            ))
        };

        let provider = {
            let mut p = HttpChatProvider::new(
                config.provider.endpoint.clone(),
                config.provider.api_key.clone(),
            );
            if let Some(ref version) = config.provider.api_version {
                p = p.with_api_version(version.clone());
            }
            Arc::new(p)
        };
        let client = Arc::new(RateLimitedClient::new(provider, &config.throttle));

        let counter = fc_core::budget::TokenCounter::new();
        match fc_memory::indexer::index_project(
            &dirs.root,
            &dirs.id,
            &store,
            embedder.as_deref(),
            &counter,
        )
        .await
        {
            Ok(n) => info!(chunks = n, "project indexed"),
            Err(e) => warn!(error = %e, "project indexing failed"),
        }

        let eph_budget = ModeBudget::for_mode(config.mode);
        let mut memory = MemoryLayers::new(
            Arc::clone(&store),
            embedder.clone(),
            EphemeralMemory::new(eph_budget.ephemeral, 1 << 20)
                .with_checkpoint_dir(dirs.checkpoints_dir()),
        );
        let indexed = memory.load_index(&dirs.id).await.unwrap_or(0);
        info!(chunks = indexed, "vector index loaded");

        let executor = fc_agents::executor::Executor::new(
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&store),
            bus.clone(),
            &dirs.root,
        );

        let mut orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            dirs.id.clone(),
            Arc::clone(&store),
            memory,
            Arc::clone(&client),
            config.provider.model.clone(),
            Arc::clone(&registry),
            executor,
            bus.clone(),
            permissions,
            config.mode,
        );

        // Seed from the most recent crashed session, if any.
        if let Some(last) = crashed.last() {
            match orchestrator.seed_from_snapshot(last).await {
                Ok(true) => info!(session = %last.id, "restored state from crash snapshot"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "could not restore crash snapshot"),
            }
        }

        let runner = Arc::new(ScopedRunner {
            store: Arc::clone(&store),
            embedder,
            client: Arc::clone(&client),
            registry: Arc::clone(&registry),
            gate: Arc::clone(&gate),
            bus: bus.clone(),
            dirs: dirs.clone(),
            model: config.provider.model.clone(),
            mode: config.mode,
        });
        let spawner = MiniAgentSpawner::new(
            config.agents.clone(),
            runner,
            bus.clone(),
            Arc::new(LifecycleManager::new(LifecycleConfig::default())),
        );
        spawner.start_queue_processor();

        Ok(Self {
            config,
            dirs,
            store,
            bus,
            gate,
            spawner,
            orchestrator: tokio::sync::Mutex::new(orchestrator),
            monitor: monitor_state,
        })
    }

    /// One-shot `run --prompt` execution.
    pub async fn run_once(&self, prompt: &str) -> Completion {
        let (abort_handle, abort_signal) = AbortHandle::new();
        spawn_interrupt_watcher(abort_handle);

        let completion = self.execute_turn(prompt, abort_signal).await;
        self.shutdown().await;
        completion
    }

    /// Run one turn and report how it ended. Shared by `run` and the REPL.
    pub async fn execute_turn(&self, prompt: &str, abort: AbortSignal) -> Completion {
        let mut orchestrator = self.orchestrator.lock().await;
        match orchestrator.run_turn(prompt, abort).await {
            Ok(TurnOutcome { aborted: true, .. }) => {
                println!("(aborted; partial results saved)");
                Completion::Aborted
            }
            Ok(outcome) => {
                println!("{}", outcome.answer);
                Completion::Success
            }
            Err(e) => {
                error!(error = %e, "turn failed");
                eprintln!("error: {e}");
                Completion::Error
            }
        }
    }

    /// Ordered shutdown: stop accepting agents, drain, end the session,
    /// then the monitor dies with the process.
    pub async fn shutdown(&self) {
        self.spawner.cancel_all().await;
        let mut orchestrator = self.orchestrator.lock().await;
        if let Err(e) = orchestrator.end_session(SessionStatus::Completed).await {
            warn!(error = %e, "failed to end session cleanly");
        }
        if let Some(ref monitor) = self.monitor {
            monitor.detach_store().await;
        }
    }
}

fn spawn_interrupt_watcher(handle: AbortHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting current turn");
            handle.abort();
        }
    });
}

// ---------------------------------------------------------------------------
// ScopedRunner: the production AgentRunner
// ---------------------------------------------------------------------------

/// Builds a scoped orchestrator per mini-agent task and drives it through
/// `execute_as_agent`.
struct ScopedRunner {
    store: Arc<SessionStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    client: Arc<RateLimitedClient>,
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    bus: EventBus,
    dirs: ProjectDirs,
    model: String,
    mode: fc_core::types::Mode,
}

#[async_trait::async_trait]
impl AgentRunner for ScopedRunner {
    async fn run(&self, task: MiniAgentTask, abort: AbortSignal) -> Result<String, String> {
        let eph_budget = ModeBudget::for_mode(self.mode);
        let memory = MemoryLayers::new(
            Arc::clone(&self.store),
            self.embedder.clone(),
            EphemeralMemory::new(eph_budget.ephemeral, 1 << 20),
        );
        let executor = fc_agents::executor::Executor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.gate),
            Arc::clone(&self.store),
            self.bus.clone(),
            &self.dirs.root,
        );
        let mut orchestrator = Orchestrator::new(
            OrchestratorConfig {
                max_iterations: task.max_iterations as usize,
                ..Default::default()
            },
            format!("{}:agent:{}", self.dirs.id, task.id),
            Arc::clone(&self.store),
            memory,
            Arc::clone(&self.client),
            self.model.clone(),
            Arc::clone(&self.registry),
            executor,
            self.bus.clone(),
            task.permissions.clone(),
            self.mode,
        );

        let max_tokens = fc_agents::spawner::AgentTemplate::for_kind(task.kind).max_tokens;
        let outcome = orchestrator
            .execute_as_agent(
                &task.prompt,
                task.scoped_context.clone(),
                task.permissions.clone(),
                max_tokens,
                task.timeout_ms,
                abort,
            )
            .await
            .map_err(|e| e.to_string())?;
        let _ = orchestrator.end_session(SessionStatus::Completed).await;
        Ok(outcome.answer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
