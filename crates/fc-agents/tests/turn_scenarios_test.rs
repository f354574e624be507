//! End-to-end turn scenarios driven through the public orchestrator API
//! with a scripted model and a stubbed search tool.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fc_agents::executor::Executor;
use fc_agents::orchestrator::{Orchestrator, OrchestratorConfig};
use fc_bridge::event_bus::EventBus;
use fc_bridge::protocol::MonitorEvent;
use fc_core::abort::AbortSignal;
use fc_core::config::ThrottleConfig;
use fc_core::store::SessionStore;
use fc_core::types::{
    ApprovalMode, Mode, Sensitivity, SessionStatus, ToolPermissions,
};
use fc_memory::ephemeral::EphemeralMemory;
use fc_memory::layers::MemoryLayers;
use fc_model::client::RateLimitedClient;
use fc_model::provider::{MockChatProvider, MockOutcome, Usage};
use fc_tools::approval::{ApprovalDecision, ApprovalGate, StaticTransport};
use fc_tools::builtin::register_builtin_tools;
use fc_tools::contract::{Tool, ToolError, ToolOutcome};
use fc_tools::registry::ToolRegistry;

// ---------------------------------------------------------------------------
// A stub web_search tool
// ---------------------------------------------------------------------------

struct StubWebSearch;

#[async_trait]
impl Tool for StubWebSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return result snippets."
    }

    fn parameter_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    fn sensitivity_hint(&self) -> Sensitivity {
        Sensitivity::Low
    }

    async fn invoke(
        &self,
        args: serde_json::Value,
        _abort: AbortSignal,
        _permissions: &ToolPermissions,
    ) -> Result<ToolOutcome, ToolError> {
        let query = args["query"].as_str().unwrap_or("");
        if query.to_lowercase().contains("bitcoin") {
            Ok(ToolOutcome::ok("Bitcoin (BTC) is trading at $97,412 USD."))
        } else {
            Ok(ToolOutcome::ok("no results"))
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Scenario {
    orchestrator: Orchestrator,
    mock: MockChatProvider,
    store: Arc<SessionStore>,
    bus: EventBus,
    _dir: tempfile::TempDir,
}

async fn scenario() -> Scenario {
    let store = Arc::new(SessionStore::in_memory().await.unwrap());
    scenario_with_store(store).await
}

async fn scenario_with_store(store: Arc<SessionStore>) -> Scenario {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();

    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, dir.path());
    registry.register(Arc::new(StubWebSearch));
    let registry = Arc::new(registry);
    let permissions = ToolPermissions::unrestricted(registry.names());

    let gate = Arc::new(ApprovalGate::new(
        ApprovalMode::Yolo,
        Arc::new(StaticTransport(ApprovalDecision::Approved)),
    ));
    let executor = Executor::new(
        Arc::clone(&registry),
        gate,
        Arc::clone(&store),
        bus.clone(),
        dir.path(),
    );

    let mock = MockChatProvider::new();
    let client = Arc::new(RateLimitedClient::new(
        Arc::new(mock.clone()),
        &ThrottleConfig::default(),
    ));
    let memory = MemoryLayers::new(
        Arc::clone(&store),
        None,
        EphemeralMemory::new(5_000, 1 << 20),
    );

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            enable_planner: false,
            ..Default::default()
        },
        "scenario-project",
        Arc::clone(&store),
        memory,
        client,
        "test-model",
        registry,
        executor,
        bus.clone(),
        permissions,
        Mode::Concise,
    );

    Scenario {
        orchestrator,
        mock,
        store,
        bus,
        _dir: dir,
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn price_inquiry_uses_web_search_and_answers_bottom_line() {
    let mut s = scenario().await;

    s.mock.push(MockOutcome::Reply {
        content: r#"function: web_search
```json
{"query": "Bitcoin price USD"}
```"#
            .into(),
        usage: Usage {
            prompt_tokens: 30,
            completion_tokens: 12,
        },
    });
    s.mock.push(MockOutcome::Reply {
        content: "Bottom Line: Bitcoin is trading around $97,412 right now.".into(),
        usage: Usage {
            prompt_tokens: 60,
            completion_tokens: 18,
        },
    });

    let outcome = s
        .orchestrator
        .run_turn("Bitcoin price", AbortSignal::never())
        .await
        .unwrap();

    // One web_search call whose query mentioned Bitcoin.
    let session_id = s.orchestrator.session().unwrap().id;
    let logs = s.store.logs_for_session(session_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].tool_name, "web_search");
    assert!(logs[0].args_summary.contains("Bitcoin"));

    // The final answer leads with "Bottom Line:" and carries a price.
    assert!(outcome.answer.starts_with("Bottom Line:"));
    assert!(outcome.answer.contains('$'));
    assert!(outcome.answer.chars().any(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn turn_events_flow_to_the_bridge_in_order() {
    let mut s = scenario().await;
    let subscriber = s.bus.subscribe();

    s.mock.push(MockOutcome::Reply {
        content: r#"<tool_use>{"name": "list_directory", "args": {}}</tool_use>"#.into(),
        usage: Usage::default(),
    });
    s.mock.push(MockOutcome::Reply {
        content: "all done".into(),
        usage: Usage::default(),
    });

    s.orchestrator
        .run_turn("look around", AbortSignal::never())
        .await
        .unwrap();

    let events = subscriber.drain();
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match &e.event {
            MonitorEvent::TurnStarted { .. } => "turn_started",
            MonitorEvent::ToolExecute { .. } => "tool_execute",
            MonitorEvent::ToolResult { .. } => "tool_result",
            MonitorEvent::TurnComplete { .. } => "turn_complete",
            MonitorEvent::TokenUsage { .. } => "token_usage",
            MonitorEvent::Snapshot { .. } => "snapshot",
            _ => "other",
        })
        .collect();

    let started = kinds.iter().position(|k| *k == "turn_started").unwrap();
    let executed = kinds.iter().position(|k| *k == "tool_execute").unwrap();
    let resulted = kinds.iter().position(|k| *k == "tool_result").unwrap();
    let completed = kinds.iter().position(|k| *k == "turn_complete").unwrap();
    assert!(started < executed);
    assert!(executed < resulted);
    assert!(resulted < completed);
    assert!(kinds.contains(&"snapshot"));
}

#[tokio::test]
async fn session_restart_seeds_from_latest_snapshot() {
    let mut s = scenario().await;
    s.mock.push(MockOutcome::Reply {
        content: "first answer".into(),
        usage: Usage::default(),
    });
    s.orchestrator
        .run_turn("remember the launch plan", AbortSignal::never())
        .await
        .unwrap();
    let old_session = s.orchestrator.session().unwrap().clone();
    assert_eq!(old_session.turn_count, 1);
    let store = Arc::clone(&s.store);
    drop(s);

    // Mark the old session crashed the way startup recovery would.
    store
        .end_session(old_session.id, SessionStatus::Crashed, 1, 0)
        .await
        .unwrap();

    // A replacement orchestrator over the same store resumes from the
    // latest snapshot: ephemeral state restored, turn count continued.
    let mut replacement = scenario_with_store(Arc::clone(&store)).await;
    let seeded = replacement
        .orchestrator
        .seed_from_snapshot(&old_session)
        .await
        .unwrap();
    assert!(seeded);

    let state = replacement.orchestrator.memory_mut().ephemeral_state();
    assert!(state
        .turns
        .iter()
        .any(|t| t.content.contains("remember the launch plan")));

    replacement.mock.push(MockOutcome::Reply {
        content: "second answer".into(),
        usage: Usage::default(),
    });
    replacement
        .orchestrator
        .run_turn("continue", AbortSignal::never())
        .await
        .unwrap();
    // Turn numbering carried over from the crashed session.
    assert_eq!(replacement.orchestrator.session().unwrap().turn_count, 2);
}
