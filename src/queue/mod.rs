//! Task Queue (component E, the hardest subsystem): single-writer actor
//! owning the `tasks_active` and `tasks_dead_letter` durable tables plus an
//! in-memory priority index (spec §4.E). Every mutation persists the full
//! record and syncs before the actor replies — batched writes are forbidden
//! (§4.E.5).

use crate::bus::{Event, EventBus};
use crate::error::{HubError, Result};
use crate::store::{DurableStore, Table};
use crate::task::{Priority, SubmitParams, Task, TaskFilter, TaskStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{info, warn};

type IndexKey = (Priority, DateTime<Utc>, String);

/// What the Scheduler asks `dequeue_highest` to respect (spec §4.F matching
/// rules). `paused_repos` holds the repo ids currently PAUSED; a task whose
/// `repo` is non-empty and a member of this set is skipped but left queued.
#[derive(Debug, Clone, Default)]
pub struct DequeueFilter {
    pub capabilities: HashSet<String>,
    pub paused_repos: HashSet<String>,
}

enum Command {
    Submit {
        params: SubmitParams,
        reply: oneshot::Sender<Result<Task>>,
    },
    Get {
        task_id: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    List {
        filter: TaskFilter,
        reply: oneshot::Sender<Vec<Task>>,
    },
    Assign {
        task_id: String,
        agent_id: String,
        default_deadline_ms: u64,
        reply: oneshot::Sender<Result<Task>>,
    },
    Complete {
        task_id: String,
        generation: u64,
        agent_id: String,
        result: serde_json::Value,
        tokens_used: Option<u64>,
        reply: oneshot::Sender<Result<Task>>,
    },
    Fail {
        task_id: String,
        generation: u64,
        agent_id: String,
        reason: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    UpdateProgress {
        task_id: String,
        generation: u64,
        agent_id: String,
        snippet: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Reclaim {
        task_id: String,
        reason: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    RetryDeadLetter {
        task_id: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    DequeueHighest {
        filter: DequeueFilter,
        reply: oneshot::Sender<Option<Task>>,
    },
    Sweep,
}

/// Cloneable handle to the Task Queue actor.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Command>,
}

pub fn spawn(
    store: &DurableStore,
    bus: EventBus,
    history_cap: usize,
    default_max_retries: u32,
    reclaim_sweep_ms: u64,
) -> Result<TaskQueue> {
    let active = store.open_table("tasks_active")?;
    let dead_letter = store.open_table("tasks_dead_letter")?;
    reconcile_dead_letter_conflicts(&active, &dead_letter)?;
    let index = build_index(&active)?;

    let (tx, mut rx) = mpsc::channel::<Command>(512);
    let sweep_tx = tx.clone();
    tokio::spawn(async move {
        let mut ticker = interval(std::time::Duration::from_millis(reclaim_sweep_ms));
        loop {
            ticker.tick().await;
            if sweep_tx.send(Command::Sweep).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut state = State {
            active,
            dead_letter,
            index,
            bus,
            history_cap,
            default_max_retries,
        };
        while let Some(command) = rx.recv().await {
            state.handle(command);
        }
    });

    Ok(TaskQueue { tx })
}

/// Startup reconciliation for invariant I5: a task must never live in both
/// tables. If the process crashed between the dead-letter insert and the
/// active delete (§4.E.5), the dead-letter copy wins.
fn reconcile_dead_letter_conflicts(active: &Table, dead_letter: &Table) -> Result<()> {
    let dead_ids: HashSet<String> = dead_letter
        .scan::<Task>()?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    for id in dead_ids {
        if active.contains(&id)? {
            warn!(task_id = %id, "task present in both active and dead-letter tables, reconciling");
            active.delete(&id)?;
        }
    }
    Ok(())
}

fn build_index(active: &Table) -> Result<BTreeSet<IndexKey>> {
    let mut index = BTreeSet::new();
    for (_, task) in active.scan::<Task>()? {
        if task.status == TaskStatus::Queued {
            index.insert((task.priority, task.created_at, task.id.clone()));
        }
    }
    Ok(index)
}

struct State {
    active: Table,
    dead_letter: Table,
    index: BTreeSet<IndexKey>,
    bus: EventBus,
    history_cap: usize,
    default_max_retries: u32,
}

impl State {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { params, reply } => {
                let _ = reply.send(self.submit(params));
            }
            Command::Get { task_id, reply } => {
                let _ = reply.send(self.get(&task_id));
            }
            Command::List { filter, reply } => {
                let _ = reply.send(self.list(&filter));
            }
            Command::Assign {
                task_id,
                agent_id,
                default_deadline_ms,
                reply,
            } => {
                let _ = reply.send(self.assign(&task_id, &agent_id, default_deadline_ms));
            }
            Command::Complete {
                task_id,
                generation,
                agent_id,
                result,
                tokens_used,
                reply,
            } => {
                let _ = reply.send(self.complete(&task_id, generation, &agent_id, result, tokens_used));
            }
            Command::Fail {
                task_id,
                generation,
                agent_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.fail(&task_id, generation, &agent_id, reason));
            }
            Command::UpdateProgress {
                task_id,
                generation,
                agent_id,
                snippet,
                reply,
            } => {
                let _ = reply.send(self.update_progress(&task_id, generation, &agent_id, snippet));
            }
            Command::Reclaim { task_id, reason, reply } => {
                let _ = reply.send(self.reclaim(&task_id, &reason));
            }
            Command::RetryDeadLetter { task_id, reply } => {
                let _ = reply.send(self.retry_dead_letter(&task_id));
            }
            Command::DequeueHighest { filter, reply } => {
                let _ = reply.send(self.dequeue_highest(&filter));
            }
            Command::Sweep => self.sweep_overdue(),
        }
    }

    fn load_active(&self, task_id: &str) -> Result<Task> {
        self.active
            .get::<Task>(task_id)?
            .ok_or_else(|| HubError::NotFound(task_id.to_string()))
    }

    fn submit(&mut self, params: SubmitParams) -> Result<Task> {
        if params.description.trim().is_empty() {
            return Err(HubError::Validation("description must not be empty".into()));
        }
        let task = Task::new(params, self.history_cap, self.default_max_retries);
        self.active.put(&task.id, &task)?;
        self.index.insert((task.priority, task.created_at, task.id.clone()));
        self.bus.publish(Event::TaskSubmitted {
            task_id: task.id.clone(),
            priority: task.priority,
        });
        Ok(task)
    }

    fn get(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.active.get::<Task>(task_id)? {
            return Ok(task);
        }
        self.dead_letter
            .get::<Task>(task_id)?
            .ok_or_else(|| HubError::NotFound(task_id.to_string()))
    }

    fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut out = Vec::new();
        if let Ok(active) = self.active.scan::<Task>() {
            out.extend(active.into_iter().map(|(_, t)| t));
        }
        if let Ok(dead) = self.dead_letter.scan::<Task>() {
            out.extend(dead.into_iter().map(|(_, t)| t));
        }
        out.retain(|t| filter.matches(t));
        out
    }

    fn assign(&mut self, task_id: &str, agent_id: &str, default_deadline_ms: u64) -> Result<Task> {
        let mut task = self.load_active(task_id)?;
        if task.status != TaskStatus::Queued {
            return Err(HubError::WrongState {
                task_id: task.id.clone(),
                state: format!("{:?}", task.status),
                expected: "QUEUED".into(),
            });
        }
        let now = Utc::now();
        self.index.remove(&(task.priority, task.created_at, task.id.clone()));
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(agent_id.to_string());
        task.assigned_at = Some(now);
        task.generation += 1;
        task.updated_at = now;
        if task.complete_by.is_none() {
            task.complete_by = Some(now + chrono::Duration::milliseconds(default_deadline_ms as i64));
        }
        task.push_history(
            TaskStatus::Assigned,
            format!("assigned to {agent_id}"),
            self.history_cap,
        );
        self.active.put(&task.id, &task)?;
        self.bus.publish(Event::TaskAssigned {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            generation: task.generation,
        });
        Ok(task)
    }

    /// Validates the `(assigned_to, generation)` fencing guard shared by
    /// `complete`, `fail`, and `update_progress` (§4.E.4, invariant I4).
    fn check_fencing<'a>(&self, task: &'a Task, agent_id: &str, generation: u64) -> Result<()> {
        if task.status != TaskStatus::Assigned {
            return Err(HubError::WrongState {
                task_id: task.id.clone(),
                state: format!("{:?}", task.status),
                expected: "ASSIGNED".into(),
            });
        }
        if task.generation != generation {
            return Err(HubError::StaleGeneration {
                task_id: task.id.clone(),
                expected: task.generation,
                got: generation,
            });
        }
        if task.assigned_to.as_deref() != Some(agent_id) {
            // Spec §9 open question: an agent reporting on a task it was
            // never assigned to is a precondition error, not a disconnect.
            return Err(HubError::Conflict(format!(
                "task {} is not assigned to {agent_id}",
                task.id
            )));
        }
        Ok(())
    }

    fn complete(
        &mut self,
        task_id: &str,
        generation: u64,
        agent_id: &str,
        result: serde_json::Value,
        tokens_used: Option<u64>,
    ) -> Result<Task> {
        let mut task = self.load_active(task_id)?;
        self.check_fencing(&task, agent_id, generation)?;
        task.status = TaskStatus::Completed;
        task.result = Some(result);
        task.tokens_used = tokens_used;
        task.updated_at = Utc::now();
        task.push_history(TaskStatus::Completed, "completed".into(), self.history_cap);
        self.active.put(&task.id, &task)?;
        self.bus.publish(Event::TaskCompleted { task_id: task.id.clone() });
        Ok(task)
    }

    fn fail(&mut self, task_id: &str, generation: u64, agent_id: &str, reason: String) -> Result<Task> {
        let mut task = self.load_active(task_id)?;
        self.check_fencing(&task, agent_id, generation)?;
        task.updated_at = Utc::now();
        task.last_error = Some(reason.clone());

        if task.retry_count + 1 < task.max_retries {
            task.status = TaskStatus::Queued;
            task.retry_count += 1;
            task.generation += 1;
            task.assigned_to = None;
            task.assigned_at = None;
            task.push_history(
                TaskStatus::Queued,
                format!("retry {} after failure: {reason}", task.retry_count),
                self.history_cap,
            );
            self.active.put(&task.id, &task)?;
            self.index.insert((task.priority, task.created_at, task.id.clone()));
            self.bus.publish(Event::TaskRetry {
                task_id: task.id.clone(),
                retry_count: task.retry_count,
            });
        } else {
            task.status = TaskStatus::DeadLetter;
            task.push_history(
                TaskStatus::DeadLetter,
                format!("moved to dead-letter: {reason}"),
                self.history_cap,
            );
            // Insert into dead-letter before deleting from active (§4.E.5);
            // a crash between these two leaves the dead-letter copy as the
            // reconciled truth on the next startup.
            self.dead_letter.put(&task.id, &task)?;
            self.active.delete(&task.id)?;
            self.bus.publish(Event::TaskDeadLetter { task_id: task.id.clone() });
        }
        Ok(task)
    }

    fn update_progress(
        &mut self,
        task_id: &str,
        generation: u64,
        agent_id: &str,
        snippet: Option<String>,
    ) -> Result<()> {
        let mut task = self.load_active(task_id)?;
        self.check_fencing(&task, agent_id, generation)?;
        task.updated_at = Utc::now();
        self.active.put(&task.id, &task)?;
        self.bus.publish(Event::TaskProgress {
            task_id: task.id.clone(),
            snippet,
        });
        Ok(())
    }

    fn reclaim(&mut self, task_id: &str, reason: &str) -> Result<Task> {
        let mut task = self.load_active(task_id)?;
        if task.status != TaskStatus::Assigned {
            // Idempotent: the task may have already completed/failed by the
            // time a reclaim lands (e.g. raced with a disconnect handler).
            return Ok(task);
        }
        let previous_agent = task.assigned_to.clone();
        task.status = TaskStatus::Queued;
        task.assigned_to = None;
        task.assigned_at = None;
        task.generation += 1;
        task.updated_at = Utc::now();
        task.push_history(TaskStatus::Queued, format!("reclaimed: {reason}"), self.history_cap);
        self.active.put(&task.id, &task)?;
        self.index.insert((task.priority, task.created_at, task.id.clone()));
        // Carries the former assignee so a subscriber can return that agent's
        // FSM to IDLE even when the task is pulled out from under it by the
        // deadline sweep rather than by the agent's own disconnect/timeout
        // path (spec §8 P2 — an agent must never be left holding a stale
        // `current_task_id` for a task someone else now owns).
        self.bus.publish(Event::TaskReclaimed {
            task_id: task.id.clone(),
            generation: task.generation,
            reason: reason.to_string(),
            agent_id: previous_agent,
        });
        Ok(task)
    }

    fn retry_dead_letter(&mut self, task_id: &str) -> Result<Task> {
        if self.active.contains(task_id)? {
            return Err(HubError::Conflict(format!("task {task_id} is not in DEAD_LETTER")));
        }
        let mut task = self
            .dead_letter
            .get::<Task>(task_id)?
            .ok_or_else(|| HubError::NotFound(task_id.to_string()))?;
        task.status = TaskStatus::Queued;
        task.retry_count = 0;
        task.generation += 1;
        task.assigned_to = None;
        task.assigned_at = None;
        task.updated_at = Utc::now();
        task.push_history(TaskStatus::Queued, "requeued from dead-letter".into(), self.history_cap);
        self.active.put(&task.id, &task)?;
        self.dead_letter.delete(&task.id)?;
        self.index.insert((task.priority, task.created_at, task.id.clone()));
        self.bus.publish(Event::TaskRequeued { task_id: task.id.clone() });
        Ok(task)
    }

    fn dequeue_highest(&self, filter: &DequeueFilter) -> Option<Task> {
        for (_, _, task_id) in self.index.iter() {
            let task = match self.active.get::<Task>(task_id).ok().flatten() {
                Some(t) => t,
                None => continue,
            };
            if !task.repo.is_empty() && filter.paused_repos.contains(&task.repo) {
                continue;
            }
            if !task.capabilities_satisfied_by(&filter.capabilities) {
                continue;
            }
            return Some(task);
        }
        None
    }

    fn sweep_overdue(&mut self) {
        let now = Utc::now();
        let overdue: Vec<String> = self
            .active
            .scan::<Task>()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(_, t)| {
                if t.status == TaskStatus::Assigned && t.complete_by.map(|d| d < now).unwrap_or(false) {
                    Some(t.id)
                } else {
                    None
                }
            })
            .collect();
        for task_id in overdue {
            if let Err(err) = self.reclaim(&task_id, "overdue") {
                warn!(%task_id, %err, "reclaim sweep failed for task");
            } else {
                info!(%task_id, "reclaimed overdue task");
            }
        }
    }
}

impl TaskQueue {
    pub async fn submit(&self, params: SubmitParams) -> Result<Task> {
        self.call(|reply| Command::Submit { params, reply }).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::Get { task_id, reply }).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Vec<Task> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::List { filter, reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn assign(&self, task_id: &str, agent_id: &str, default_deadline_ms: u64) -> Result<Task> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.call(|reply| Command::Assign {
            task_id,
            agent_id,
            default_deadline_ms,
            reply,
        })
        .await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        generation: u64,
        agent_id: &str,
        result: serde_json::Value,
        tokens_used: Option<u64>,
    ) -> Result<Task> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.call(|reply| Command::Complete {
            task_id,
            generation,
            agent_id,
            result,
            tokens_used,
            reply,
        })
        .await
    }

    pub async fn fail(&self, task_id: &str, generation: u64, agent_id: &str, reason: String) -> Result<Task> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.call(|reply| Command::Fail {
            task_id,
            generation,
            agent_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn update_progress(
        &self,
        task_id: &str,
        generation: u64,
        agent_id: &str,
        snippet: Option<String>,
    ) -> Result<()> {
        let task_id = task_id.to_string();
        let agent_id = agent_id.to_string();
        self.call(|reply| Command::UpdateProgress {
            task_id,
            generation,
            agent_id,
            snippet,
            reply,
        })
        .await
    }

    pub async fn reclaim(&self, task_id: &str, reason: &str) -> Result<Task> {
        let task_id = task_id.to_string();
        let reason = reason.to_string();
        self.call(|reply| Command::Reclaim { task_id, reason, reply }).await
    }

    pub async fn retry_dead_letter(&self, task_id: &str) -> Result<Task> {
        let task_id = task_id.to_string();
        self.call(|reply| Command::RetryDeadLetter { task_id, reply }).await
    }

    pub async fn dequeue_highest(&self, filter: DequeueFilter) -> Option<Task> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::DequeueHighest { filter, reply: reply_tx })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    async fn call<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("task queue actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("task queue actor dropped reply")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_queue() -> (TaskQueue, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        (spawn(&store, bus, 50, 3, 30_000).unwrap(), dir)
    }

    fn params(desc: &str) -> SubmitParams {
        SubmitParams {
            description: desc.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_then_assign_then_complete() {
        let (queue, _dir) = test_queue().await;
        let task = queue.submit(params("t")).await.unwrap();
        let assigned = queue.assign(&task.id, "agent-a", 1_800_000).await.unwrap();
        assert_eq!(assigned.generation, 1);
        let completed = queue
            .complete(&task.id, 1, "agent-a", serde_json::json!({"ok": true}), None)
            .await
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn stale_generation_is_rejected() {
        let (queue, _dir) = test_queue().await;
        let task = queue.submit(params("t")).await.unwrap();
        queue.assign(&task.id, "agent-a", 1_800_000).await.unwrap(); // gen=1
        queue.reclaim(&task.id, "overdue").await.unwrap(); // gen=2
        queue.assign(&task.id, "agent-b", 1_800_000).await.unwrap(); // gen=3
        let err = queue
            .complete(&task.id, 1, "agent-a", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::StaleGeneration { .. }));
    }

    #[tokio::test]
    async fn retry_ceiling_moves_to_dead_letter() {
        let (queue, _dir) = test_queue().await;
        let task = queue
            .submit(SubmitParams {
                description: "t".into(),
                max_retries: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        let a1 = queue.assign(&task.id, "a", 1_800_000).await.unwrap();
        let f1 = queue.fail(&task.id, a1.generation, "a", "boom".into()).await.unwrap();
        assert_eq!(f1.status, TaskStatus::Queued);

        let a2 = queue.assign(&task.id, "a", 1_800_000).await.unwrap();
        let f2 = queue.fail(&task.id, a2.generation, "a", "boom".into()).await.unwrap();
        assert_eq!(f2.status, TaskStatus::DeadLetter);

        assert!(queue.get(&task.id).await.is_ok());
        let err = queue.assign(&task.id, "a", 1_800_000).await.unwrap_err();
        assert!(matches!(err, HubError::WrongState { .. }));
    }

    #[tokio::test]
    async fn priority_and_fifo_ordering() {
        let (queue, _dir) = test_queue().await;
        let low = queue
            .submit(SubmitParams {
                description: "low".into(),
                priority: Some(Priority::Low),
                ..Default::default()
            })
            .await
            .unwrap();
        let urgent = queue
            .submit(SubmitParams {
                description: "urgent".into(),
                priority: Some(Priority::Urgent),
                ..Default::default()
            })
            .await
            .unwrap();
        let normal = queue
            .submit(SubmitParams {
                description: "normal".into(),
                priority: Some(Priority::Normal),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = queue.dequeue_highest(DequeueFilter::default()).await.unwrap();
        assert_eq!(first.id, urgent.id);
        queue.assign(&first.id, "a", 1_800_000).await.unwrap();

        let second = queue.dequeue_highest(DequeueFilter::default()).await.unwrap();
        assert_eq!(second.id, normal.id);
        queue.assign(&second.id, "a", 1_800_000).await.unwrap();

        let third = queue.dequeue_highest(DequeueFilter::default()).await.unwrap();
        assert_eq!(third.id, low.id);
    }

    #[tokio::test]
    async fn capability_filter_excludes_unqualified_agents() {
        let (queue, _dir) = test_queue().await;
        queue
            .submit(SubmitParams {
                description: "needs code".into(),
                needed_capabilities: ["code".to_string()].into_iter().collect(),
                ..Default::default()
            })
            .await
            .unwrap();

        let docs_only = DequeueFilter {
            capabilities: ["docs".to_string()].into_iter().collect(),
            paused_repos: Default::default(),
        };
        assert!(queue.dequeue_highest(docs_only).await.is_none());

        let code_and_docs = DequeueFilter {
            capabilities: ["code".to_string(), "docs".to_string()].into_iter().collect(),
            paused_repos: Default::default(),
        };
        assert!(queue.dequeue_highest(code_and_docs).await.is_some());
    }

    #[tokio::test]
    async fn reclaim_bumps_generation_and_requeues() {
        let (queue, _dir) = test_queue().await;
        let task = queue.submit(params("t")).await.unwrap();
        let assigned = queue.assign(&task.id, "a", 1_800_000).await.unwrap();
        let reclaimed = queue.reclaim(&task.id, "overdue").await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert!(reclaimed.generation > assigned.generation);
    }

    #[tokio::test]
    async fn completion_by_unassigned_agent_is_rejected_without_mutation() {
        let (queue, _dir) = test_queue().await;
        let task = queue.submit(params("t")).await.unwrap();
        let assigned = queue.assign(&task.id, "a", 1_800_000).await.unwrap();
        let err = queue
            .complete(&task.id, assigned.generation, "mallory", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
        let unchanged = queue.get(&task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn reconciliation_prefers_dead_letter_on_conflict() {
        let dir = tempdir().unwrap();
        {
            let store = DurableStore::open(dir.path()).unwrap();
            let active = store.open_table("tasks_active").unwrap();
            let dead_letter = store.open_table("tasks_dead_letter").unwrap();
            let task = Task::new(params("t"), 50, 3);
            active.put(&task.id, &task).unwrap();
            dead_letter.put(&task.id, &task).unwrap();
        }
        let store = DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        let queue = spawn(&store, bus, 50, 3, 30_000).unwrap();
        let listed = queue.list(TaskFilter::default()).await;
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn submitted_task_survives_an_unclean_restart() {
        let dir = tempdir().unwrap();
        let task_id = {
            let store = DurableStore::open(dir.path()).unwrap();
            let bus = crate::bus::spawn();
            let queue = spawn(&store, bus, 50, 3, 30_000).unwrap();
            let task = queue.submit(params("t")).await.unwrap();
            task.id
            // `store` and `queue` are dropped here without an explicit
            // `close()`, standing in for an unclean process kill.
        };

        let store = DurableStore::open(dir.path()).unwrap();
        let bus = crate::bus::spawn();
        let queue = spawn(&store, bus, 50, 3, 30_000).unwrap();
        let task = queue.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.generation, 0);
    }
}
