//! Per-agent data model and finite state machine (component D, spec §3.2,
//! §4.D). `fsm` holds the actor; this module holds the shared types.

pub mod fsm;
pub mod registry;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FsmState {
    Offline,
    Idle,
    Assigned,
    Working,
    Blocked,
}

impl FsmState {
    /// Valid transition table from spec §3.2.
    pub fn can_transition_to(self, next: FsmState) -> bool {
        use FsmState::*;
        matches!(
            (self, next),
            (Offline, Idle)
                | (Idle, Offline)
                | (Idle, Assigned)
                | (Assigned, Working)
                | (Assigned, Idle)
                | (Assigned, Offline)
                | (Working, Idle)
                | (Working, Blocked)
                | (Working, Offline)
                | (Blocked, Working)
                | (Blocked, Idle)
                | (Blocked, Offline)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub state: FsmState,
    pub current_task_id: Option<String>,
    pub current_task_generation: Option<u64>,
}
