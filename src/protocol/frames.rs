//! Wire frame types for the Agent WebSocket Protocol Machine (spec §4.G,
//! §6.1). Every frame is a JSON object tagged by `type`; field names here are
//! part of the external interface and must not be renamed casually.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Identify {
        agent_id: String,
        token: String,
        name: Option<String>,
        #[serde(default)]
        capabilities: HashSet<String>,
        status: Option<String>,
    },
    Ping,
    Status {
        status: String,
    },
    TaskAccepted {
        task_id: String,
    },
    TaskProgress {
        task_id: String,
        snippet: Option<String>,
    },
    TaskComplete {
        task_id: String,
        generation: u64,
        result: serde_json::Value,
        tokens_used: Option<u64>,
    },
    TaskFailed {
        task_id: String,
        generation: u64,
        reason: String,
    },
    TaskRecovering {
        task_id: String,
    },
    TaskRejected {
        task_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Identified {
        agent_id: String,
    },
    Pong {
        server_time: DateTime<Utc>,
    },
    TaskAssign {
        task_id: String,
        description: String,
        metadata: HashMap<String, String>,
        generation: u64,
        complete_by: Option<DateTime<Utc>>,
    },
    TaskContinue {
        task_id: String,
        generation: u64,
    },
    TaskReassign {
        task_id: String,
    },
    AgentJoined {
        agent_id: String,
    },
    AgentLeft {
        agent_id: String,
    },
    StatusChanged {
        agent_id: String,
        status: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutboundFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
