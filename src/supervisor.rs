//! Supervisor / Lifecycle (component J, spec §4.J): brings components up in
//! dependency order, applies a `one_for_one` restart to the Scheduler, and
//! drains connections before closing the Durable Store on shutdown. Grounded
//! in the teacher's `main.rs`, which races the orchestrator and API server
//! with `tokio::select!` — generalized here into an explicit startup/run/
//! shutdown sequence with restart supervision.

use crate::agent::registry::AgentFsmRegistry;
use crate::bus;
use crate::config::Config;
use crate::protocol::abuse::AbuseTracker;
use crate::queue::TaskQueue;
use crate::state::AppState;
use crate::store::DurableStore;
use crate::{auth, presence, repo, scheduler};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Wires `PresenceRegistry`'s reaper timeout into the FSM + Task Queue:
/// a heartbeat lapse disconnects the agent's FSM and reclaims any task it
/// held, the same cleanup a dropped WebSocket connection performs.
struct FsmTimeoutSink {
    fsm_registry: AgentFsmRegistry,
    queue: TaskQueue,
}

#[async_trait::async_trait]
impl presence::TimeoutSink for FsmTimeoutSink {
    async fn on_agent_timeout(&self, agent_id: &str) {
        let Some(fsm) = self.fsm_registry.get(agent_id).await else {
            return;
        };
        if let Some((task_id, _generation)) = fsm.on_disconnect().await {
            if let Err(err) = self.queue.reclaim(&task_id, "heartbeat_timeout").await {
                error!(%task_id, %err, "failed to reclaim task after heartbeat timeout");
            }
        }
    }
}

/// Starts every component in dependency order and serves the combined
/// WebSocket + HTTP admin surface until shutdown is requested (ctrl-c).
pub async fn run(config: Config) -> crate::Result<()> {
    let config = Arc::new(config);

    // A: Durable Store.
    let store = DurableStore::open(&config.data_dir)?;

    // H: Event Bus. Spawned ahead of its letter position because B/C/E all
    // publish to it; dependency order, not label order, governs startup.
    let bus = bus::spawn();

    // B: Auth Registry.
    let auth_registry = auth::spawn(&store, config.admin_agents.clone())?;

    // E: Task Queue.
    let queue = scheduler_queue(&store, bus.clone(), &config)?;

    // D: per-agent FSM registry (lazy — actors spawn on first contact).
    let fsm_registry = AgentFsmRegistry::new(
        Duration::from_millis(config.acceptance_timeout_ms),
        queue.clone(),
        bus.clone(),
    );
    let _reclaim_notifier = spawn_reclaim_notifier(bus.clone(), fsm_registry.clone());

    // C: Presence Registry, wired to reclaim in-flight work on timeout.
    let timeout_sink = Arc::new(FsmTimeoutSink {
        fsm_registry: fsm_registry.clone(),
        queue: queue.clone(),
    });
    let presence = presence::spawn(bus.clone(), config.heartbeat_timeout_ms, timeout_sink);

    let repos = repo::spawn(&store)?;

    let state = AppState {
        queue: queue.clone(),
        presence: presence.clone(),
        auth: auth_registry,
        fsm_registry: fsm_registry.clone(),
        bus: bus.clone(),
        repos: repos.clone(),
        abuse: Arc::new(AbuseTracker::new()),
        config: config.clone(),
        connections: Default::default(),
    };

    // F: Scheduler, under one_for_one restart.
    let scheduler_handle = spawn_scheduler_supervised(queue, presence, repos, fsm_registry, bus, &config);

    // G + I: Agent Protocol (via `/ws`) and Admin/HTTP surface share one
    // axum router (component boundary is logical, not a separate server).
    let app = crate::api::router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await.map_err(|e| {
        crate::error::HubError::Internal(anyhow::anyhow!("failed to bind {}: {e}", config.listen_addr))
    })?;
    info!(addr = %config.listen_addr, "agentcom-hub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| crate::error::HubError::Internal(anyhow::anyhow!("server error: {e}")))?;

    info!("shutting down: no longer accepting connections");
    scheduler_handle.abort();
    store.close()?;
    info!("durable store closed, shutdown complete");
    Ok(())
}

fn scheduler_queue(store: &DurableStore, bus: bus::EventBus, config: &Config) -> crate::Result<TaskQueue> {
    crate::queue::spawn(store, bus, config.history_cap, 3, config.reclaim_sweep_ms)
}

fn spawn_scheduler_supervised(
    queue: TaskQueue,
    presence: presence::PresenceRegistry,
    repos: repo::RepoTable,
    fsm_registry: AgentFsmRegistry,
    bus: bus::EventBus,
    config: &Config,
) -> tokio::task::JoinHandle<()> {
    let default_deadline_ms = config.default_deadline_ms;
    let tick_ms = config.scheduler_tick_ms;
    tokio::spawn(async move {
        loop {
            let handle = scheduler::spawn(
                queue.clone(),
                presence.clone(),
                repos.clone(),
                fsm_registry.clone(),
                bus.clone(),
                default_deadline_ms,
                tick_ms,
            );
            match handle.await {
                Ok(()) => break,
                Err(join_err) if join_err.is_cancelled() => break,
                Err(join_err) => {
                    error!(%join_err, "scheduler task panicked, restarting (one_for_one)");
                }
            }
        }
    })
}

/// Returns an agent's FSM to IDLE when one of its in-flight tasks is pulled
/// out from under it by the Task Queue's deadline sweep (spec §8 P2) — the
/// same cleanup `on_disconnect` and the acceptance timer already do for
/// their own triggers, wired here via the bus instead of a direct call to
/// avoid a construction cycle between the Task Queue and the FSM registry.
fn spawn_reclaim_notifier(bus: bus::EventBus, fsm_registry: AgentFsmRegistry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.subscribe(bus::Topic::Tasks).await;
        while let Some(event) = rx.recv().await {
            if let bus::Event::TaskReclaimed {
                task_id,
                agent_id: Some(agent_id),
                ..
            } = event
            {
                if let Some(fsm) = fsm_registry.get(&agent_id).await {
                    fsm.on_task_reclaimed(&task_id).await;
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
