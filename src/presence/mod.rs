//! Presence Registry (component C): in-memory set of connected agents, owned
//! by a single-writer actor so reads are always snapshot copies (spec §5 —
//! "no external reader reads the live structure").

use crate::bus::{Event, EventBus};
use crate::constants::PRESENCE_REAP_INTERVAL;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub agent_id: String,
    pub capabilities: std::collections::HashSet<String>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: String,
}

enum Command {
    Register {
        agent_id: String,
        capabilities: std::collections::HashSet<String>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        agent_id: String,
        reply: oneshot::Sender<()>,
    },
    UpdateStatus {
        agent_id: String,
        status: String,
        reply: oneshot::Sender<()>,
    },
    Touch {
        agent_id: String,
        reply: oneshot::Sender<()>,
    },
    List {
        reply: oneshot::Sender<Vec<PresenceEntry>>,
    },
    IsConnected {
        agent_id: String,
        reply: oneshot::Sender<bool>,
    },
    ReapSweep,
}

/// Callback invoked by the reaper for every agent whose heartbeat lapsed.
/// Kept as a trait object so the FSM layer can be wired in without the
/// presence module depending on it directly.
#[async_trait::async_trait]
pub trait TimeoutSink: Send + Sync {
    async fn on_agent_timeout(&self, agent_id: &str);
}

#[derive(Clone)]
pub struct PresenceRegistry {
    tx: mpsc::Sender<Command>,
}

pub fn spawn(
    bus: EventBus,
    heartbeat_timeout_ms: u64,
    timeout_sink: std::sync::Arc<dyn TimeoutSink>,
) -> PresenceRegistry {
    let (tx, mut rx) = mpsc::channel::<Command>(512);
    let sweep_tx = tx.clone();
    tokio::spawn(async move {
        let mut ticker = interval(PRESENCE_REAP_INTERVAL);
        loop {
            ticker.tick().await;
            if sweep_tx.send(Command::ReapSweep).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut entries: HashMap<String, PresenceEntry> = HashMap::new();
        let timeout = chrono::Duration::milliseconds(heartbeat_timeout_ms as i64);
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register {
                    agent_id,
                    capabilities,
                    reply,
                } => {
                    let now = Utc::now();
                    entries.insert(
                        agent_id.clone(),
                        PresenceEntry {
                            agent_id: agent_id.clone(),
                            capabilities,
                            connected_at: now,
                            last_seen_at: now,
                            status: "idle".to_string(),
                        },
                    );
                    info!(%agent_id, "agent registered in presence");
                    bus.publish(Event::AgentJoined { agent_id });
                    let _ = reply.send(());
                }
                Command::Unregister { agent_id, reply } => {
                    if entries.remove(&agent_id).is_some() {
                        bus.publish(Event::AgentLeft { agent_id });
                    }
                    let _ = reply.send(());
                }
                Command::UpdateStatus { agent_id, status, reply } => {
                    if let Some(entry) = entries.get_mut(&agent_id) {
                        entry.status = status.clone();
                        entry.last_seen_at = Utc::now();
                        bus.publish(Event::StatusChanged { agent_id, status });
                    }
                    let _ = reply.send(());
                }
                Command::Touch { agent_id, reply } => {
                    if let Some(entry) = entries.get_mut(&agent_id) {
                        entry.last_seen_at = Utc::now();
                    }
                    let _ = reply.send(());
                }
                Command::List { reply } => {
                    let _ = reply.send(entries.values().cloned().collect());
                }
                Command::IsConnected { agent_id, reply } => {
                    let _ = reply.send(entries.contains_key(&agent_id));
                }
                Command::ReapSweep => {
                    let now = Utc::now();
                    let stale: Vec<String> = entries
                        .values()
                        .filter(|e| now.signed_duration_since(e.last_seen_at) > timeout)
                        .map(|e| e.agent_id.clone())
                        .collect();
                    for agent_id in stale {
                        warn!(%agent_id, "presence reaper evicting stale agent");
                        entries.remove(&agent_id);
                        bus.publish(Event::AgentLeft {
                            agent_id: agent_id.clone(),
                        });
                        timeout_sink.on_agent_timeout(&agent_id).await;
                    }
                }
            }
        }
    });

    PresenceRegistry { tx }
}

impl PresenceRegistry {
    pub async fn register(&self, agent_id: &str, capabilities: std::collections::HashSet<String>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Register {
                agent_id: agent_id.to_string(),
                capabilities,
                reply: reply_tx,
            })
            .await;
        let _ = reply_rx.await;
    }

    pub async fn unregister(&self, agent_id: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Unregister {
                agent_id: agent_id.to_string(),
                reply: reply_tx,
            })
            .await;
        let _ = reply_rx.await;
    }

    pub async fn update_status(&self, agent_id: &str, status: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::UpdateStatus {
                agent_id: agent_id.to_string(),
                status: status.to_string(),
                reply: reply_tx,
            })
            .await;
        let _ = reply_rx.await;
    }

    pub async fn touch(&self, agent_id: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::Touch {
                agent_id: agent_id.to_string(),
                reply: reply_tx,
            })
            .await;
        let _ = reply_rx.await;
    }

    pub async fn list(&self) -> Vec<PresenceEntry> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::List { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::IsConnected {
                agent_id: agent_id.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl TimeoutSink for CountingSink {
        async fn on_agent_timeout(&self, _agent_id: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_then_list_shows_entry() {
        let bus = crate::bus::spawn();
        let sink = Arc::new(CountingSink(Arc::new(AtomicUsize::new(0))));
        let presence = spawn(bus, 90_000, sink);
        presence.register("agent-1", Default::default()).await;
        let all = presence.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].agent_id, "agent-1");
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let bus = crate::bus::spawn();
        let sink = Arc::new(CountingSink(Arc::new(AtomicUsize::new(0))));
        let presence = spawn(bus, 90_000, sink);
        presence.register("agent-1", Default::default()).await;
        presence.unregister("agent-1").await;
        assert!(presence.list().await.is_empty());
    }

    #[tokio::test]
    async fn touch_bumps_last_seen() {
        let bus = crate::bus::spawn();
        let sink = Arc::new(CountingSink(Arc::new(AtomicUsize::new(0))));
        let presence = spawn(bus, 90_000, sink);
        presence.register("agent-1", Default::default()).await;
        let before = presence.list().await[0].last_seen_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        presence.touch("agent-1").await;
        let after = presence.list().await[0].last_seen_at;
        assert!(after >= before);
    }
}
