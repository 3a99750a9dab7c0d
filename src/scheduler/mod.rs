//! Scheduler (component F): an event- and tick-driven matcher. Mostly
//! stateless — it owns only its tick timer and re-derives everything else
//! from the Task Queue, Presence, and Repo tables on every pass (spec §4.F).

use crate::agent::registry::AgentFsmRegistry;
use crate::agent::FsmState;
use crate::bus::{EventBus, Topic};
use crate::presence::PresenceRegistry;
use crate::protocol::frames::OutboundFrame;
use crate::queue::{DequeueFilter, TaskQueue};
use crate::repo::RepoTable;
use tokio::time::interval;
use tracing::{debug, info};

/// Spawns the scheduler's tick/event loop and returns its `JoinHandle` so the
/// Supervisor can apply the `one_for_one` restart policy (spec §4.J) if the
/// task exits unexpectedly — the scheduler is stateless, so a fresh `spawn`
/// with the same actor handles picks up exactly where the crashed one left
/// off.
pub fn spawn(
    queue: TaskQueue,
    presence: PresenceRegistry,
    repos: RepoTable,
    fsm_registry: AgentFsmRegistry,
    bus: EventBus,
    default_deadline_ms: u64,
    tick_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tasks_rx = bus.subscribe(Topic::Tasks).await;
        let mut agents_rx = bus.subscribe(Topic::Agents).await;
        let mut ticker = interval(std::time::Duration::from_millis(tick_ms));

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(_event) = tasks_rx.recv() => {}
                Some(_event) = agents_rx.recv() => {}
                else => break,
            }
            run_pass(&queue, &presence, &repos, &fsm_registry, default_deadline_ms).await;
        }
    })
}

async fn run_pass(
    queue: &TaskQueue,
    presence: &PresenceRegistry,
    repos: &RepoTable,
    fsm_registry: &AgentFsmRegistry,
    default_deadline_ms: u64,
) {
    let mut idle_agents = idle_agents(presence, fsm_registry).await;
    // Prefer the longest-waiting agent first (spec §4.F step 2).
    idle_agents.sort_by_key(|(_, last_seen_at)| *last_seen_at);

    for (agent_id, _) in idle_agents {
        let Some(fsm) = fsm_registry.get(&agent_id).await else {
            continue;
        };
        let capabilities = match presence.list().await.into_iter().find(|e| e.agent_id == agent_id) {
            Some(entry) => entry.capabilities,
            None => continue,
        };
        let paused_repos = repos.paused_ids().await;

        loop {
            let filter = DequeueFilter {
                capabilities: capabilities.clone(),
                paused_repos: paused_repos.clone(),
            };
            let Some(candidate) = queue.dequeue_highest(filter).await else {
                break;
            };

            match queue.assign(&candidate.id, &agent_id, default_deadline_ms).await {
                Ok(task) => {
                    if fsm.on_assign(&task.id, task.generation).await.is_err() {
                        // Agent is no longer IDLE by the time we commit the
                        // assignment; reclaim immediately rather than leave
                        // an orphaned ASSIGNED task with nobody to work it.
                        let _ = queue.reclaim(&task.id, "agent_not_idle").await;
                        break;
                    }
                    fsm.send_frame(OutboundFrame::TaskAssign {
                        task_id: task.id.clone(),
                        description: task.description.clone(),
                        metadata: task.metadata.clone(),
                        generation: task.generation,
                        complete_by: task.complete_by,
                    })
                    .await;
                    info!(%agent_id, task_id = %task.id, generation = task.generation, "scheduler assigned task");
                    break;
                }
                Err(_) => {
                    // Task was taken concurrently (raced another scheduler
                    // pass); retry dequeue for this agent (§4.F step 2c).
                    debug!(task_id = %candidate.id, "assign race lost, retrying dequeue");
                    continue;
                }
            }
        }
    }
}

async fn idle_agents(
    presence: &PresenceRegistry,
    fsm_registry: &AgentFsmRegistry,
) -> Vec<(String, chrono::DateTime<chrono::Utc>)> {
    let mut out = Vec::new();
    for entry in presence.list().await {
        if !presence.is_connected(&entry.agent_id).await {
            continue;
        }
        if let Some(fsm) = fsm_registry.get(&entry.agent_id).await {
            if let Some(snapshot) = fsm.get_state().await {
                if snapshot.state == FsmState::Idle {
                    out.push((entry.agent_id, entry.last_seen_at));
                }
            }
        }
    }
    out
}
