//! Event Bus (component H): in-process multi-producer multi-consumer
//! publish/subscribe. Each subscriber owns a bounded mailbox; a producer
//! never blocks on a slow subscriber — an overflowing mailbox drops the
//! event and logs a warning (spec §4.H).

use crate::constants::EVENT_BUS_SUBSCRIBER_CAPACITY;
use crate::task::{Priority, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Tasks,
    Agents,
    Presence,
}

/// Immutable value records published on the bus. Downstream consumers (the
/// dashboard relay, an audit log) should tolerate gaps rather than trust the
/// bus for completeness (spec §9 Design Notes).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    TaskSubmitted { task_id: String, priority: Priority },
    TaskAssigned { task_id: String, agent_id: String, generation: u64 },
    TaskProgress { task_id: String, snippet: Option<String> },
    TaskCompleted { task_id: String },
    TaskRetry { task_id: String, retry_count: u32 },
    TaskDeadLetter { task_id: String },
    TaskReclaimed { task_id: String, generation: u64, reason: String, agent_id: Option<String> },
    TaskRequeued { task_id: String },
    TaskStatusChanged { task_id: String, status: TaskStatus },
    AgentJoined { agent_id: String },
    AgentLeft { agent_id: String },
    AgentIdle { agent_id: String },
    AgentConnected { agent_id: String },
    AgentDisconnected { agent_id: String },
    StatusChanged { agent_id: String, status: String },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::TaskSubmitted { .. }
            | Event::TaskAssigned { .. }
            | Event::TaskProgress { .. }
            | Event::TaskCompleted { .. }
            | Event::TaskRetry { .. }
            | Event::TaskDeadLetter { .. }
            | Event::TaskReclaimed { .. }
            | Event::TaskRequeued { .. }
            | Event::TaskStatusChanged { .. } => Topic::Tasks,
            Event::AgentJoined { .. }
            | Event::AgentLeft { .. }
            | Event::AgentIdle { .. }
            | Event::AgentConnected { .. }
            | Event::AgentDisconnected { .. } => Topic::Agents,
            Event::StatusChanged { .. } => Topic::Presence,
        }
    }
}

enum Command {
    Subscribe {
        topic: Topic,
        reply: oneshot::Sender<mpsc::Receiver<Event>>,
    },
    Publish(Event),
}

/// Cloneable client handle for the Event Bus actor.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Command>,
}

pub fn spawn() -> EventBus {
    let (tx, mut rx) = mpsc::channel::<Command>(1024);
    tokio::spawn(async move {
        let mut subscribers: HashMap<Topic, Vec<mpsc::Sender<Event>>> = HashMap::new();
        while let Some(command) = rx.recv().await {
            match command {
                Command::Subscribe { topic, reply } => {
                    let (sub_tx, sub_rx) = mpsc::channel(EVENT_BUS_SUBSCRIBER_CAPACITY);
                    subscribers.entry(topic).or_default().push(sub_tx);
                    let _ = reply.send(sub_rx);
                }
                Command::Publish(event) => {
                    let topic = event.topic();
                    if let Some(subs) = subscribers.get_mut(&topic) {
                        subs.retain(|sub| match sub.try_send(event.clone()) {
                            Ok(()) => true,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                warn!(?topic, "event bus subscriber mailbox full, dropping event");
                                true
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => false,
                        });
                    }
                }
            }
        }
    });
    EventBus { tx }
}

impl EventBus {
    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Event> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Subscribe { topic, reply: reply_tx }).await;
        reply_rx.await.expect("event bus actor dropped reply channel")
    }

    /// Best-effort publish; the bus never reports backpressure to the
    /// producer (spec §5 Backpressure).
    pub fn publish(&self, event: Event) {
        if let Err(err) = self.tx.try_send(Command::Publish(event)) {
            warn!(%err, "event bus command channel saturated, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = spawn();
        let mut rx = bus.subscribe(Topic::Tasks).await;
        bus.publish(Event::TaskSubmitted {
            task_id: "task-1".into(),
            priority: Priority::Normal,
        });
        let event = rx.recv().await.unwrap();
        matches!(event, Event::TaskSubmitted { .. });
    }

    #[tokio::test]
    async fn subscriber_on_other_topic_does_not_receive() {
        let bus = spawn();
        let mut agents_rx = bus.subscribe(Topic::Agents).await;
        bus.publish(Event::TaskSubmitted {
            task_id: "task-1".into(),
            priority: Priority::Normal,
        });
        bus.publish(Event::AgentJoined { agent_id: "a".into() });
        let event = agents_rx.recv().await.unwrap();
        matches!(event, Event::AgentJoined { .. });
    }

    #[tokio::test]
    async fn overflowing_mailbox_drops_without_blocking_producer() {
        let bus = spawn();
        let _rx = bus.subscribe(Topic::Tasks).await;
        for _ in 0..(EVENT_BUS_SUBSCRIBER_CAPACITY + 10) {
            bus.publish(Event::TaskSubmitted {
                task_id: "task-x".into(),
                priority: Priority::Low,
            });
        }
        // If publish blocked on a full mailbox this test would hang, not fail.
    }
}
