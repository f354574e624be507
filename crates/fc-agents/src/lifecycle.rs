use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use fc_core::types::{AgentKind, AgentStatus};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// No heartbeat for this long marks the agent timed out.
    pub stale_timeout: Duration,
    /// Completed records are pruned after this long.
    pub retention: Duration,
    /// More than this many active alerts force-terminates the agent.
    pub max_alerts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_timeout: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            max_alerts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Tracked state for one mini-agent, live or recently finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub task_id: Uuid,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub alerts: u32,
    pub tools_used: u32,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Actions the sweep decided on; the spawner applies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Heartbeat went stale: abort the agent and mark it timed out.
    TimeOut(Uuid),
    /// Too many active alerts: force-terminate.
    ForceTerminate(Uuid),
    /// Retention expired: the record was removed.
    Pruned(Uuid),
}

// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

/// Tracks heartbeats and health for every spawned mini-agent and decides
/// when one must be timed out, force-terminated, or pruned.
pub struct LifecycleManager {
    config: LifecycleConfig,
    records: Mutex<HashMap<Uuid, AgentRecord>>,
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, task_id: Uuid, kind: AgentKind) {
        let now = Utc::now();
        self.records.lock().expect("lifecycle lock poisoned").insert(
            task_id,
            AgentRecord {
                task_id,
                kind,
                status: AgentStatus::Running,
                spawned_at: now,
                last_heartbeat: now,
                alerts: 0,
                tools_used: 0,
                finished_at: None,
            },
        );
    }

    pub fn heartbeat(&self, task_id: Uuid) {
        if let Some(record) = self
            .records
            .lock()
            .expect("lifecycle lock poisoned")
            .get_mut(&task_id)
        {
            record.last_heartbeat = Utc::now();
        }
    }

    pub fn raise_alert(&self, task_id: Uuid) {
        if let Some(record) = self
            .records
            .lock()
            .expect("lifecycle lock poisoned")
            .get_mut(&task_id)
        {
            record.alerts += 1;
            warn!(agent = %task_id, alerts = record.alerts, "agent health alert");
        }
    }

    pub fn record_tool_use(&self, task_id: Uuid) {
        if let Some(record) = self
            .records
            .lock()
            .expect("lifecycle lock poisoned")
            .get_mut(&task_id)
        {
            record.tools_used += 1;
        }
    }

    /// Mark an agent finished with its terminal status.
    pub fn finish(&self, task_id: Uuid, status: AgentStatus) {
        if let Some(record) = self
            .records
            .lock()
            .expect("lifecycle lock poisoned")
            .get_mut(&task_id)
        {
            record.status = status;
            record.finished_at = Some(Utc::now());
            info!(agent = %task_id, ?status, tools_used = record.tools_used, "agent finished");
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<AgentRecord> {
        self.records
            .lock()
            .expect("lifecycle lock poisoned")
            .get(&task_id)
            .cloned()
    }

    pub fn running_count(&self) -> usize {
        self.records
            .lock()
            .expect("lifecycle lock poisoned")
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// One sweep pass: detect stale heartbeats, critical health, and
    /// expired records. Pruned records are removed here; other actions are
    /// returned for the spawner to enforce.
    pub fn sweep(&self) -> Vec<SweepAction> {
        let now = Utc::now();
        let stale = chrono::Duration::from_std(self.config.stale_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut actions = Vec::new();
        let mut records = self.records.lock().expect("lifecycle lock poisoned");

        let mut to_prune = Vec::new();
        for record in records.values() {
            if record.status.is_terminal() {
                if let Some(finished) = record.finished_at {
                    if now - finished > retention {
                        to_prune.push(record.task_id);
                    }
                }
                continue;
            }
            if record.alerts > self.config.max_alerts {
                actions.push(SweepAction::ForceTerminate(record.task_id));
            } else if now - record.last_heartbeat > stale {
                actions.push(SweepAction::TimeOut(record.task_id));
            }
        }
        for task_id in to_prune {
            records.remove(&task_id);
            actions.push(SweepAction::Pruned(task_id));
        }
        actions
    }

    #[cfg(test)]
    fn backdate_heartbeat(&self, task_id: Uuid, by: chrono::Duration) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&task_id) {
            record.last_heartbeat -= by;
        }
    }

    #[cfg(test)]
    fn backdate_finish(&self, task_id: Uuid, by: chrono::Duration) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&task_id) {
            record.finished_at = Some(Utc::now() - by);
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_finish_lifecycle() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Search);
        assert_eq!(manager.running_count(), 1);

        manager.record_tool_use(id);
        manager.finish(id, AgentStatus::Completed);
        assert_eq!(manager.running_count(), 0);
        let record = manager.get(id).unwrap();
        assert_eq!(record.status, AgentStatus::Completed);
        assert_eq!(record.tools_used, 1);
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn stale_heartbeat_times_out() {
        let manager = LifecycleManager::default();
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        manager.register(fresh, AgentKind::General);
        manager.register(stale, AgentKind::General);
        manager.backdate_heartbeat(stale, chrono::Duration::minutes(6));

        let actions = manager.sweep();
        assert_eq!(actions, vec![SweepAction::TimeOut(stale)]);
    }

    #[test]
    fn heartbeat_keeps_agent_alive() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Test);
        manager.backdate_heartbeat(id, chrono::Duration::minutes(6));
        manager.heartbeat(id);
        assert!(manager.sweep().is_empty());
    }

    #[test]
    fn too_many_alerts_force_terminates() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Migration);
        for _ in 0..4 {
            manager.raise_alert(id);
        }
        let actions = manager.sweep();
        assert_eq!(actions, vec![SweepAction::ForceTerminate(id)]);
    }

    #[test]
    fn three_alerts_is_still_tolerated() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Migration);
        for _ in 0..3 {
            manager.raise_alert(id);
        }
        assert!(manager.sweep().is_empty());
    }

    #[test]
    fn finished_records_prune_after_retention() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Analysis);
        manager.finish(id, AgentStatus::Completed);
        manager.backdate_finish(id, chrono::Duration::hours(25));

        let actions = manager.sweep();
        assert_eq!(actions, vec![SweepAction::Pruned(id)]);
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn recent_finished_records_are_retained() {
        let manager = LifecycleManager::default();
        let id = Uuid::new_v4();
        manager.register(id, AgentKind::Analysis);
        manager.finish(id, AgentStatus::Failed);
        assert!(manager.sweep().is_empty());
        assert!(manager.get(id).is_some());
    }
}
