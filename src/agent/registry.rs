//! Process-lifetime registry of per-agent FSM actors, keyed by `agent_id`.
//! Grounded in the teacher's `AgentRegistry` (`Arc<RwLock<HashMap<...>>>`
//! over `Arc<dyn Agent>` handles) — same shape, different payload.

use super::fsm::{self, AgentFsm};
use crate::bus::EventBus;
use crate::queue::TaskQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AgentFsmRegistry {
    inner: Arc<RwLock<HashMap<String, AgentFsm>>>,
    acceptance_timeout: Duration,
    queue: TaskQueue,
    bus: EventBus,
}

impl AgentFsmRegistry {
    pub fn new(acceptance_timeout: Duration, queue: TaskQueue, bus: EventBus) -> Self {
        AgentFsmRegistry {
            inner: Arc::new(RwLock::new(HashMap::new())),
            acceptance_timeout,
            queue,
            bus,
        }
    }

    /// Returns the existing FSM for `agent_id`, spawning a fresh one (in
    /// `OFFLINE`) if this is the agent's first contact.
    pub async fn get_or_create(&self, agent_id: &str) -> AgentFsm {
        if let Some(fsm) = self.inner.read().await.get(agent_id) {
            return fsm.clone();
        }
        let mut guard = self.inner.write().await;
        guard
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                fsm::spawn(agent_id.to_string(), self.acceptance_timeout, self.queue.clone(), self.bus.clone())
            })
            .clone()
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentFsm> {
        self.inner.read().await.get(agent_id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DurableStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn get_or_create_reuses_existing_actor() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        let queue = crate::queue::spawn(&store, bus.clone(), 50, 3, 30_000).unwrap();
        let registry = AgentFsmRegistry::new(Duration::from_secs(1), queue, bus);

        let first = registry.get_or_create("agent-1").await;
        first.on_identify(tokio::sync::mpsc::channel(4).0).await;
        let second = registry.get_or_create("agent-1").await;
        // Same underlying actor: state set via `first` is visible via `second`.
        assert_eq!(
            second.get_state().await.unwrap().state,
            crate::agent::FsmState::Idle
        );
    }
}
