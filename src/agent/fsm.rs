//! Per-agent FSM actor. One instance is spawned per `agent_id` the first
//! time it identifies, and lives for the lifetime of the hub process so
//! reconnects resume the same state machine (spec §4.D).

use super::{AgentSnapshot, FsmState};
use crate::bus::{Event, EventBus};
use crate::error::{HubError, Result};
use crate::protocol::frames::OutboundFrame;
use crate::queue::TaskQueue;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

enum Command {
    Identify {
        ws_handle: mpsc::Sender<OutboundFrame>,
        reply: oneshot::Sender<()>,
    },
    Assign {
        task_id: String,
        generation: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    TaskAccepted {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StartWork {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Complete {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Fail {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Option<(String, u64)>>,
    },
    TaskReclaimed {
        task_id: String,
        reply: oneshot::Sender<()>,
    },
    GetState {
        reply: oneshot::Sender<AgentSnapshot>,
    },
    SendFrame {
        frame: OutboundFrame,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to one agent's FSM actor.
#[derive(Clone)]
pub struct AgentFsm {
    tx: mpsc::Sender<Command>,
}

pub fn spawn(agent_id: String, acceptance_timeout: Duration, queue: TaskQueue, bus: EventBus) -> AgentFsm {
    let (tx, mut rx) = mpsc::channel::<Command>(64);
    tokio::spawn(async move {
        let mut fsm = Inner {
            agent_id,
            state: FsmState::Offline,
            ws_handle: None,
            current_task_id: None,
            current_task_generation: None,
            acceptance_timeout,
            queue,
            bus,
        };
        let mut timer: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;
        loop {
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    match maybe_cmd {
                        Some(command) => fsm.handle(command, &mut timer).await,
                        None => break,
                    }
                }
                _ = async { timer.as_mut().unwrap().as_mut().await }, if timer.is_some() => {
                    timer = None;
                    fsm.on_acceptance_timeout().await;
                }
            }
        }
    });
    AgentFsm { tx }
}

struct Inner {
    agent_id: String,
    state: FsmState,
    ws_handle: Option<mpsc::Sender<OutboundFrame>>,
    current_task_id: Option<String>,
    current_task_generation: Option<u64>,
    acceptance_timeout: Duration,
    queue: TaskQueue,
    bus: EventBus,
}

impl Inner {
    async fn handle(&mut self, command: Command, timer: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
        match command {
            Command::Identify { ws_handle, reply } => {
                self.ws_handle = Some(ws_handle);
                self.transition(FsmState::Idle);
                let _ = reply.send(());
            }
            Command::Assign {
                task_id,
                generation,
                reply,
            } => {
                let result = if self.state != FsmState::Idle {
                    Err(HubError::InvalidTransition(format!(
                        "agent {} is not IDLE, cannot assign",
                        self.agent_id
                    )))
                } else {
                    self.transition(FsmState::Assigned);
                    self.current_task_id = Some(task_id);
                    self.current_task_generation = Some(generation);
                    *timer = Some(Box::pin(tokio::time::sleep(self.acceptance_timeout)));
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::TaskAccepted { task_id, reply } => {
                let result = if self.current_task_id.as_deref() == Some(task_id.as_str()) {
                    *timer = None;
                    Ok(())
                } else {
                    Err(HubError::InvalidTransition(format!(
                        "task_accepted for {task_id} does not match current task"
                    )))
                };
                let _ = reply.send(result);
            }
            Command::StartWork { task_id, reply } => {
                let result = if self.current_task_id.as_deref() == Some(task_id.as_str())
                    && self.state == FsmState::Assigned
                {
                    self.transition(FsmState::Working);
                    Ok(())
                } else {
                    Err(HubError::InvalidTransition(format!(
                        "agent {} cannot start work on {task_id} from {:?}",
                        self.agent_id, self.state
                    )))
                };
                let _ = reply.send(result);
            }
            Command::Complete { task_id, reply } | Command::Fail { task_id, reply } => {
                let result = if self.current_task_id.as_deref() == Some(task_id.as_str()) {
                    self.transition(FsmState::Idle);
                    self.current_task_id = None;
                    self.current_task_generation = None;
                    *timer = None;
                    Ok(())
                } else {
                    Err(HubError::InvalidTransition(format!(
                        "completion/failure for {task_id} does not match current task"
                    )))
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let in_flight = self
                    .current_task_id
                    .clone()
                    .zip(self.current_task_generation);
                self.transition(FsmState::Offline);
                self.ws_handle = None;
                self.current_task_id = None;
                self.current_task_generation = None;
                *timer = None;
                let _ = reply.send(in_flight);
            }
            Command::TaskReclaimed { task_id, reply } => {
                if self.current_task_id.as_deref() == Some(task_id.as_str()) {
                    self.current_task_id = None;
                    self.current_task_generation = None;
                    *timer = None;
                    // A connection drop already moved a disconnected agent
                    // to OFFLINE; don't resurrect it into IDLE here.
                    if self.state != FsmState::Offline {
                        self.transition(FsmState::Idle);
                    }
                }
                let _ = reply.send(());
            }
            Command::GetState { reply } => {
                let _ = reply.send(AgentSnapshot {
                    agent_id: self.agent_id.clone(),
                    state: self.state,
                    current_task_id: self.current_task_id.clone(),
                    current_task_generation: self.current_task_generation,
                });
            }
            Command::SendFrame { frame, reply } => {
                let sent = match &self.ws_handle {
                    Some(handle) => handle.try_send(frame).is_ok(),
                    None => false,
                };
                let _ = reply.send(sent);
            }
        }
    }

    async fn on_acceptance_timeout(&mut self) {
        if let Some(task_id) = self.current_task_id.take() {
            warn!(agent_id = %self.agent_id, %task_id, "acceptance timer expired, reclaiming task");
            if let Err(err) = self.queue.reclaim(&task_id, "acceptance_timeout").await {
                warn!(%task_id, %err, "failed to reclaim task after acceptance timeout");
            }
        }
        self.current_task_generation = None;
        self.transition(FsmState::Idle);
    }

    fn transition(&mut self, next: FsmState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(agent_id = %self.agent_id, from = ?self.state, to = ?next, "forcing otherwise-invalid FSM transition");
        }
        info!(agent_id = %self.agent_id, from = ?self.state, to = ?next, "agent fsm transition");
        self.state = next;
        if next == FsmState::Idle {
            self.bus.publish(Event::AgentIdle { agent_id: self.agent_id.clone() });
        }
    }
}

impl AgentFsm {
    pub async fn on_identify(&self, ws_handle: mpsc::Sender<OutboundFrame>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Identify { ws_handle, reply: reply_tx }).await;
        let _ = reply_rx.await;
    }

    pub async fn on_assign(&self, task_id: &str, generation: u64) -> Result<()> {
        self.call(|reply| Command::Assign {
            task_id: task_id.to_string(),
            generation,
            reply,
        })
        .await
    }

    pub async fn on_task_accepted(&self, task_id: &str) -> Result<()> {
        self.call(|reply| Command::TaskAccepted {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn on_start_work(&self, task_id: &str) -> Result<()> {
        self.call(|reply| Command::StartWork {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn on_complete(&self, task_id: &str) -> Result<()> {
        self.call(|reply| Command::Complete {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn on_fail(&self, task_id: &str) -> Result<()> {
        self.call(|reply| Command::Fail {
            task_id: task_id.to_string(),
            reply,
        })
        .await
    }

    /// Returns the `(task_id, generation)` that was in flight, if any, so
    /// the caller can hand it to the Task Queue for reclamation.
    pub async fn on_disconnect(&self) -> Option<(String, u64)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Disconnect { reply: reply_tx }).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    /// Tells this FSM that a task it was holding got reclaimed out from
    /// under it (deadline sweep, not its own disconnect/acceptance timer).
    /// A no-op unless `task_id` still matches `current_task_id`.
    pub async fn on_task_reclaimed(&self, task_id: &str) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::TaskReclaimed { task_id: task_id.to_string(), reply: reply_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    pub async fn get_state(&self) -> Option<AgentSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::GetState { reply: reply_tx }).await.is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    /// Hands a frame to the connection actor's outbound mailbox via the
    /// FSM, which is the sole owner of `ws_handle` (spec §5). Returns
    /// `false` if the agent has no live connection or its outbox is full.
    pub async fn send_frame(&self, frame: OutboundFrame) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::SendFrame { frame, reply: reply_tx }).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn call<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("agent fsm actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("agent fsm actor dropped reply")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DurableStore;
    use tempfile::tempdir;

    async fn test_fsm(agent_id: &str) -> (AgentFsm, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        let queue = crate::queue::spawn(&store, bus.clone(), 50, 3, 30_000).unwrap();
        (spawn(agent_id.to_string(), Duration::from_millis(50), queue, bus), dir)
    }

    #[tokio::test]
    async fn identify_transitions_to_idle() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        let snap = fsm.get_state().await.unwrap();
        assert_eq!(snap.state, FsmState::Idle);
    }

    #[tokio::test]
    async fn assign_then_accept_then_complete() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        fsm.on_assign("task-1", 1).await.unwrap();
        assert_eq!(fsm.get_state().await.unwrap().state, FsmState::Assigned);
        fsm.on_task_accepted("task-1").await.unwrap();
        fsm.on_start_work("task-1").await.unwrap();
        assert_eq!(fsm.get_state().await.unwrap().state, FsmState::Working);
        fsm.on_complete("task-1").await.unwrap();
        assert_eq!(fsm.get_state().await.unwrap().state, FsmState::Idle);
    }

    #[tokio::test]
    async fn acceptance_timeout_returns_agent_to_idle() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        fsm.on_assign("task-1", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let snap = fsm.get_state().await.unwrap();
        assert_eq!(snap.state, FsmState::Idle);
        assert!(snap.current_task_id.is_none());
    }

    #[tokio::test]
    async fn task_reclaimed_while_working_returns_agent_to_idle() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        fsm.on_assign("task-1", 1).await.unwrap();
        fsm.on_task_accepted("task-1").await.unwrap();
        fsm.on_start_work("task-1").await.unwrap();
        assert_eq!(fsm.get_state().await.unwrap().state, FsmState::Working);

        fsm.on_task_reclaimed("task-1").await;

        let snap = fsm.get_state().await.unwrap();
        assert_eq!(snap.state, FsmState::Idle);
        assert!(snap.current_task_id.is_none());
    }

    #[tokio::test]
    async fn task_reclaimed_for_a_different_task_is_ignored() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        fsm.on_assign("task-1", 1).await.unwrap();

        fsm.on_task_reclaimed("some-other-task").await;

        let snap = fsm.get_state().await.unwrap();
        assert_eq!(snap.state, FsmState::Assigned);
        assert_eq!(snap.current_task_id.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn disconnect_reports_in_flight_task() {
        let (fsm, _dir) = test_fsm("a").await;
        let (tx, _rx) = mpsc::channel(4);
        fsm.on_identify(tx).await;
        fsm.on_assign("task-1", 3).await.unwrap();
        let in_flight = fsm.on_disconnect().await;
        assert_eq!(in_flight, Some(("task-1".to_string(), 3)));
        assert_eq!(fsm.get_state().await.unwrap().state, FsmState::Offline);
    }
}
