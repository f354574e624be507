use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use fc_core::project::ProjectMeta;
use fc_core::store::SessionStore;
use fc_core::types::{AgentKind, AgentStatus};
use fc_telemetry::metrics::MetricsCollector;

use crate::event_bus::EventBus;
use crate::protocol::{MonitorEnvelope, MonitorEvent};

/// Events retained in the in-memory ring for `/api/events`.
const EVENT_RING_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// MonitorState
// ---------------------------------------------------------------------------

/// A live view of one mini-agent, maintained from bus events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub agent_id: Uuid,
    pub parent_id: Uuid,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub last_progress: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Shared state behind the monitoring endpoints.
///
/// The bridge is attach-/detach-able: with no store attached it serves only
/// what it has in memory, and `/api/health` keeps answering even when the
/// database is unreadable.
pub struct MonitorState {
    pub bus: EventBus,
    pub metrics: Arc<MetricsCollector>,
    store: RwLock<Option<Arc<SessionStore>>>,
    start: Instant,
    agents: RwLock<HashMap<Uuid, AgentView>>,
    projects: RwLock<Vec<ProjectMeta>>,
    recent: Mutex<VecDeque<MonitorEnvelope>>,
    memory_report: RwLock<Option<serde_json::Value>>,
}

impl MonitorState {
    pub fn new(bus: EventBus, metrics: Arc<MetricsCollector>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            metrics,
            store: RwLock::new(None),
            start: Instant::now(),
            agents: RwLock::new(HashMap::new()),
            projects: RwLock::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            memory_report: RwLock::new(None),
        })
    }

    /// Attach the durable store (the source of truth for counters).
    pub async fn attach_store(&self, store: Arc<SessionStore>) {
        *self.store.write().await = Some(store);
    }

    /// Detach, falling back to in-memory snapshots only.
    pub async fn detach_store(&self) {
        *self.store.write().await = None;
    }

    pub async fn register_project(&self, meta: ProjectMeta) {
        let mut projects = self.projects.write().await;
        projects.retain(|p| p.project_id != meta.project_id);
        projects.push(meta);
    }

    /// Consume bus events into the live views. Runs until the process exits.
    pub fn start_collector(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let subscriber = state.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = subscriber.recv().await;
                state.absorb(&envelope).await;
            }
        });
    }

    async fn absorb(&self, envelope: &MonitorEnvelope) {
        {
            let mut recent = self.recent.lock().expect("ring lock poisoned");
            if recent.len() >= EVENT_RING_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(envelope.clone());
        }

        match &envelope.event {
            MonitorEvent::TurnComplete { .. } => {
                self.metrics.increment("turns_completed", &[]);
            }
            MonitorEvent::ToolExecute { tool, .. } => {
                self.metrics.increment("tool_calls", &[("tool", tool)]);
            }
            MonitorEvent::ToolResult { tool, success, .. } => {
                let outcome = if *success { "ok" } else { "error" };
                self.metrics
                    .increment("tool_results", &[("tool", tool), ("outcome", outcome)]);
            }
            MonitorEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                ..
            } => {
                self.metrics
                    .increment_by("prompt_tokens", &[], *prompt_tokens);
                self.metrics
                    .increment_by("completion_tokens", &[], *completion_tokens);
            }
            MonitorEvent::BudgetReport { report, .. } => {
                *self.memory_report.write().await = Some(report.clone());
            }
            MonitorEvent::AgentSpawned {
                agent_id,
                parent_id,
                kind,
            } => {
                self.agents.write().await.insert(
                    *agent_id,
                    AgentView {
                        agent_id: *agent_id,
                        parent_id: *parent_id,
                        kind: *kind,
                        status: AgentStatus::Running,
                        last_progress: None,
                        updated_at: Utc::now(),
                    },
                );
            }
            MonitorEvent::AgentProgress { agent_id, message } => {
                if let Some(view) = self.agents.write().await.get_mut(agent_id) {
                    view.last_progress = Some(message.clone());
                    view.updated_at = Utc::now();
                }
            }
            MonitorEvent::AgentCompleted { agent_id, status } => {
                let mut agents = self.agents.write().await;
                if status.is_terminal() {
                    agents.remove(agent_id);
                } else if let Some(view) = agents.get_mut(agent_id) {
                    view.status = *status;
                }
            }
            MonitorEvent::Error { source, kind, .. } => {
                self.metrics
                    .increment("errors", &[("source", source), ("kind", kind)]);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the read-only monitoring router.
pub fn monitor_router(state: Arc<MonitorState>) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/overview", get(get_overview))
        .route("/api/memory", get(get_memory))
        .route("/api/tools", get(get_tools))
        .route("/api/sessions", get(get_sessions))
        .route("/api/pipeline", get(get_pipeline))
        .route("/api/agents", get(get_agents))
        .route("/api/projects", get(get_projects))
        .route("/api/events", get(get_events))
        .route("/api/metrics/clear", post(clear_metrics))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Bind and serve on `port`. Returns the bound address.
pub async fn serve(
    state: Arc<MonitorState>,
    port: u16,
) -> std::io::Result<std::net::SocketAddr> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    let addr = listener.local_addr()?;
    let router = monitor_router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "monitor server exited");
        }
    });
    info!(%addr, "monitoring server listening");
    Ok(addr)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.start.elapsed().as_secs(),
    }))
}

async fn get_overview(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    // The durable counters are the source of truth; the in-memory metrics
    // snapshot is a cache layered on top.
    let (durable, sessions, db_ok) = match state.store.read().await.as_ref() {
        Some(store) => match (store.counters().await, store.recent_sessions(100).await) {
            (Ok(counters), Ok(sessions)) => (counters, sessions.len(), true),
            _ => (HashMap::new(), 0, false),
        },
        None => (HashMap::new(), 0, false),
    };

    Json(serde_json::json!({
        "counters": durable,
        "session_count": sessions,
        "cached": {
            "turns_completed": state.metrics.get_total("turns_completed"),
            "tool_calls": state.metrics.get_total("tool_calls"),
            "prompt_tokens": state.metrics.get_total("prompt_tokens"),
            "completion_tokens": state.metrics.get_total("completion_tokens"),
            "errors": state.metrics.get_total("errors"),
        },
        "health": {
            "database": if db_ok { "ok" } else { "unavailable" },
            "uptime": state.start.elapsed().as_secs(),
        },
    }))
}

async fn get_memory(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let chunk_count = match state.store.read().await.as_ref() {
        Some(store) => store.chunk_count().await.unwrap_or(0),
        None => 0,
    };
    let report = state.memory_report.read().await.clone();
    Json(serde_json::json!({
        "budget": report,
        "chunk_count": chunk_count,
    }))
}

async fn get_tools(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let recent = match state.store.read().await.as_ref() {
        Some(store) => store.recent_logs(20).await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stats: Vec<serde_json::Value> = state
        .metrics
        .snapshot()
        .into_iter()
        .filter(|(name, _, _)| name == "tool_calls" || name == "tool_results")
        .map(|(name, labels, value)| {
            serde_json::json!({ "metric": name, "labels": labels, "value": value })
        })
        .collect();
    Json(serde_json::json!({
        "stats": stats,
        "recent": recent,
    }))
}

async fn get_sessions(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let sessions = match state.store.read().await.as_ref() {
        Some(store) => store.recent_sessions(20).await.unwrap_or_default(),
        None => Vec::new(),
    };
    Json(serde_json::json!({ "sessions": sessions }))
}

async fn get_pipeline(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "nodes": [
            { "id": "orchestrator", "label": "Orchestrator" },
            { "id": "planner", "label": "Planner" },
            { "id": "memory", "label": "Memory Layers" },
            { "id": "model", "label": "Model Client" },
            { "id": "executor", "label": "Executor" },
            { "id": "approval", "label": "Approval Gate" },
            { "id": "tools", "label": "Tool Registry" },
            { "id": "store", "label": "Session Store" },
        ],
        "edges": [
            { "from": "orchestrator", "to": "planner" },
            { "from": "orchestrator", "to": "memory" },
            { "from": "memory", "to": "model" },
            { "from": "model", "to": "executor" },
            { "from": "executor", "to": "approval" },
            { "from": "approval", "to": "tools" },
            { "from": "orchestrator", "to": "store" },
        ],
        "stats": {
            "turns": state.metrics.get_total("turns_completed"),
            "tool_calls": state.metrics.get_total("tool_calls"),
            "errors": state.metrics.get_total("errors"),
        },
    }))
}

async fn get_agents(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let agents: Vec<AgentView> = state.agents.read().await.values().cloned().collect();
    Json(serde_json::json!({ "agents": agents }))
}

async fn get_projects(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    let projects = state.projects.read().await.clone();
    Json(serde_json::json!({ "projects": projects }))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn get_events(
    State(state): State<Arc<MonitorState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(EVENT_RING_CAPACITY);
    let recent = state.recent.lock().expect("ring lock poisoned");
    let events: Vec<MonitorEnvelope> = recent.iter().rev().take(limit).cloned().collect();
    Json(serde_json::json!({ "events": events }))
}

async fn clear_metrics(State(state): State<Arc<MonitorState>>) -> impl IntoResponse {
    state.metrics.reset();
    Json(serde_json::json!({ "cleared": true }))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MonitorState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_events(socket, state))
}

async fn push_events(mut socket: WebSocket, state: Arc<MonitorState>) {
    let subscriber = state.bus.subscribe();
    loop {
        let envelope = subscriber.recv().await;
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(_) => continue,
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
