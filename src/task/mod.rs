//! Task data model (spec §3.1). The Task Queue actor (`crate::queue`) is the
//! only writer of these records; everything else sees immutable snapshots.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::constants::TASK_ID_HEX_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Completed,
    Failed,
    DeadLetter,
}

/// One entry in a task's bounded audit trail (§4.E.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub complete_by: Option<DateTime<Utc>>,
    pub generation: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub needed_capabilities: HashSet<String>,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Inbound parameters accepted by `submit` (§4.E.2). Everything but
/// `description` is optional and defaulted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitParams {
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub needed_capabilities: HashSet<String>,
    #[serde(default)]
    pub repo: String,
    pub max_retries: Option<u32>,
    pub complete_by: Option<DateTime<Utc>>,
}

/// Filter accepted by `list` (§4.E.2). `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub repo: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if task.priority != priority {
                return false;
            }
        }
        if let Some(repo) = &self.repo {
            if &task.repo != repo {
                return false;
            }
        }
        true
    }
}

impl Task {
    pub fn new(params: SubmitParams, history_cap: usize, max_retries_default: u32) -> Self {
        let now = Utc::now();
        let mut task = Task {
            id: generate_task_id(),
            description: params.description,
            metadata: params.metadata,
            priority: params.priority.unwrap_or_default(),
            status: TaskStatus::Queued,
            assigned_to: None,
            assigned_at: None,
            updated_at: now,
            created_at: now,
            complete_by: params.complete_by,
            generation: 0,
            retry_count: 0,
            max_retries: params.max_retries.unwrap_or(max_retries_default),
            last_error: None,
            result: None,
            tokens_used: None,
            needed_capabilities: params.needed_capabilities,
            repo: params.repo,
            history: Vec::new(),
        };
        task.push_history(TaskStatus::Queued, "submitted".to_string(), history_cap);
        task
    }

    /// Appends an entry, enforcing the 50-entry retention cap by trimming
    /// from the front (§4.E.6 / P8).
    pub fn push_history(&mut self, state: TaskStatus, details: String, cap: usize) {
        self.history.push(HistoryEntry {
            state,
            timestamp: self.updated_at,
            details,
        });
        if self.history.len() > cap {
            let overflow = self.history.len() - cap;
            self.history.drain(0..overflow);
        }
    }

    /// True iff `agent_capabilities` is a superset of what this task needs.
    pub fn capabilities_satisfied_by(&self, agent_capabilities: &HashSet<String>) -> bool {
        self.needed_capabilities.is_subset(agent_capabilities)
    }
}

fn generate_task_id() -> String {
    let mut bytes = [0u8; TASK_ID_HEX_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("task-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_queued_with_generation_zero() {
        let task = Task::new(
            SubmitParams {
                description: "do the thing".into(),
                ..Default::default()
            },
            50,
            3,
        );
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.generation, 0);
        assert!(task.assigned_to.is_none());
        assert_eq!(task.history.len(), 1);
    }

    #[test]
    fn task_ids_are_unique_and_prefixed() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
        assert_eq!(a.len(), "task-".len() + TASK_ID_HEX_LEN);
    }

    #[test]
    fn history_trims_to_cap() {
        let mut task = Task::new(
            SubmitParams {
                description: "x".into(),
                ..Default::default()
            },
            3,
            3,
        );
        for i in 0..10 {
            task.push_history(TaskStatus::Queued, format!("event {i}"), 3);
        }
        assert_eq!(task.history.len(), 3);
        assert_eq!(task.history.last().unwrap().details, "event 9");
    }

    #[test]
    fn capability_superset_matching() {
        let task = Task::new(
            SubmitParams {
                description: "x".into(),
                needed_capabilities: ["code".to_string()].into_iter().collect(),
                ..Default::default()
            },
            50,
            3,
        );
        let docs_only: HashSet<String> = ["docs".to_string()].into_iter().collect();
        let code_and_docs: HashSet<String> = ["code".to_string(), "docs".to_string()].into_iter().collect();
        assert!(!task.capabilities_satisfied_by(&docs_only));
        assert!(task.capabilities_satisfied_by(&code_and_docs));
    }
}
