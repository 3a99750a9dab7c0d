//! Shared handle bundle wired together by the Supervisor and handed to both
//! the WebSocket protocol layer and the HTTP admin surface.

use crate::agent::registry::AgentFsmRegistry;
use crate::auth::AuthRegistry;
use crate::bus::EventBus;
use crate::config::Config;
use crate::presence::PresenceRegistry;
use crate::protocol::abuse::AbuseTracker;
use crate::queue::TaskQueue;
use crate::repo::RepoTable;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Per-agent kill switch used to enforce the singleton-connection invariant
/// (I6): identifying again for an already-connected `agent_id` fires the
/// prior connection's switch before the new one is installed.
pub type ConnectionRegistry = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn installing_a_second_connection_fires_the_first_kill_switch() {
        let registry: ConnectionRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, _second_rx) = oneshot::channel();

        registry.lock().await.insert("agent-a".to_string(), first_tx);

        let mut guard = registry.lock().await;
        if let Some(previous) = guard.remove("agent-a") {
            let _ = previous.send(());
        }
        guard.insert("agent-a".to_string(), second_tx);
        drop(guard);

        assert!(first_rx.await.is_ok());
        assert_eq!(registry.lock().await.len(), 1);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub presence: PresenceRegistry,
    pub auth: AuthRegistry,
    pub fsm_registry: AgentFsmRegistry,
    pub bus: EventBus,
    pub repos: RepoTable,
    pub abuse: Arc<AbuseTracker>,
    pub config: Arc<Config>,
    pub connections: ConnectionRegistry,
}
