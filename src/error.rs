use thiserror::Error;

/// Convenience alias for results carrying a [`HubError`].
pub type Result<T> = std::result::Result<T, HubError>;

/// Error type for the AgentCom hub.
///
/// Every fallible core operation (store, queue, scheduler, protocol, auth)
/// returns one of these variants so the protocol and HTTP layers can map
/// errors to wire-level codes without guessing at intent.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("durable store error: {0}")]
    Store(#[from] sled::Error),

    #[error("durable store is corrupt and could not be repaired: {0}")]
    StoreCorrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {task_id} has stale generation: expected {expected}, got {got}")]
    StaleGeneration {
        task_id: String,
        expected: u64,
        got: u64,
    },

    #[error("task {task_id} is in state {state:?}, expected {expected:?}")]
    WrongState {
        task_id: String,
        state: String,
        expected: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication failed")]
    Unauthorized,

    #[error("admin privileges required")]
    Forbidden,

    #[error("task queue is full (max: {0})")]
    QueueFull(usize),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("agent fsm rejected transition: {0}")]
    InvalidTransition(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HubError {
    /// Short machine-readable code used in `error` frames and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Store(_) | HubError::StoreCorrupt(_) => "store_error",
            HubError::Serialization(_) => "serialization_error",
            HubError::Configuration(_) => "configuration_error",
            HubError::NotFound(_) => "not_found",
            HubError::StaleGeneration { .. } => "stale_generation",
            HubError::WrongState { .. } => "wrong_state",
            HubError::Validation(_) => "validation_failed",
            HubError::Unauthorized => "unauthorized",
            HubError::Forbidden => "forbidden",
            HubError::QueueFull(_) => "queue_full",
            HubError::Conflict(_) => "conflict",
            HubError::InvalidTransition(_) => "invalid_transition",
            HubError::Internal(_) => "internal_error",
        }
    }
}
