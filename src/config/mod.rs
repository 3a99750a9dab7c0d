use crate::constants::{
    DEFAULT_ACCEPTANCE_TIMEOUT_MS, DEFAULT_DEADLINE_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_HISTORY_CAP, DEFAULT_SCHEDULER_TICK_MS, DEFAULT_VALIDATION_FAILURE_THRESHOLD,
};
use crate::error::{HubError, Result};
use std::collections::HashSet;
use std::path::PathBuf;

/// Hub configuration, loaded once at startup and handed by `Arc` to every
/// component that needs it. Fields mirror the recognized keys in spec §6.4.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub admin_agents: HashSet<String>,
    pub heartbeat_timeout_ms: u64,
    pub acceptance_timeout_ms: u64,
    pub default_deadline_ms: u64,
    pub reclaim_sweep_ms: u64,
    pub scheduler_tick_ms: u64,
    pub history_cap: usize,
    pub validation_failure_threshold: u32,
}

impl Config {
    /// Loads configuration from the environment (optionally via a `.env`
    /// file), applying defaults and then validating. Fails fast: a
    /// misconfigured hub should refuse to start rather than run with
    /// ambiguous settings.
    pub fn load() -> Result<Self> {
        // Best-effort: a missing .env file is not an error, local overrides
        // to the real environment always win.
        let _ = dotenvy::dotenv();

        let listen_addr =
            std::env::var("AGENTCOM_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());

        let data_dir = std::env::var("AGENTCOM_DATA_DIR")
            .unwrap_or_else(|_| "./data".to_string())
            .into();

        let admin_agents = std::env::var("AGENTCOM_ADMIN_AGENTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<HashSet<_>>();

        let heartbeat_timeout_ms = env_u64("AGENTCOM_HEARTBEAT_TIMEOUT_MS", DEFAULT_HEARTBEAT_TIMEOUT_MS)?;
        let acceptance_timeout_ms =
            env_u64("AGENTCOM_ACCEPTANCE_TIMEOUT_MS", DEFAULT_ACCEPTANCE_TIMEOUT_MS)?;
        let default_deadline_ms = env_u64("AGENTCOM_DEFAULT_DEADLINE_MS", DEFAULT_DEADLINE_MS)?;
        let reclaim_sweep_ms = env_u64("AGENTCOM_RECLAIM_SWEEP_MS", 30_000)?;
        let scheduler_tick_ms = env_u64("AGENTCOM_SCHEDULER_TICK_MS", DEFAULT_SCHEDULER_TICK_MS)?;
        let history_cap = env_u64("AGENTCOM_HISTORY_CAP", DEFAULT_HISTORY_CAP as u64)? as usize;
        let validation_failure_threshold = env_u64(
            "AGENTCOM_VALIDATION_FAILURE_THRESHOLD",
            DEFAULT_VALIDATION_FAILURE_THRESHOLD as u64,
        )? as u32;

        let config = Config {
            listen_addr,
            data_dir,
            admin_agents,
            heartbeat_timeout_ms,
            acceptance_timeout_ms,
            default_deadline_ms,
            reclaim_sweep_ms,
            scheduler_tick_ms,
            history_cap,
            validation_failure_threshold,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(HubError::Configuration("listen_addr must not be empty".into()));
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(HubError::Configuration(
                "heartbeat_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.acceptance_timeout_ms == 0 {
            return Err(HubError::Configuration(
                "acceptance_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.scheduler_tick_ms == 0 {
            return Err(HubError::Configuration(
                "scheduler_tick_ms must be greater than zero".into(),
            ));
        }
        if self.history_cap == 0 {
            return Err(HubError::Configuration("history_cap must be greater than zero".into()));
        }
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| HubError::Configuration(format!("{key} must be a non-negative integer, got {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "AGENTCOM_LISTEN_ADDR",
            "AGENTCOM_DATA_DIR",
            "AGENTCOM_ADMIN_AGENTS",
            "AGENTCOM_HEARTBEAT_TIMEOUT_MS",
            "AGENTCOM_ACCEPTANCE_TIMEOUT_MS",
            "AGENTCOM_DEFAULT_DEADLINE_MS",
            "AGENTCOM_RECLAIM_SWEEP_MS",
            "AGENTCOM_SCHEDULER_TICK_MS",
            "AGENTCOM_HISTORY_CAP",
            "AGENTCOM_VALIDATION_FAILURE_THRESHOLD",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn load_applies_defaults() {
        clear_env();
        let config = Config::load().expect("defaults should validate");
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.history_cap, DEFAULT_HISTORY_CAP);
        assert!(config.admin_agents.is_empty());
    }

    #[test]
    #[serial]
    fn load_parses_admin_agents() {
        clear_env();
        std::env::set_var("AGENTCOM_ADMIN_AGENTS", "agent-a, agent-b ,agent-a");
        let config = Config::load().unwrap();
        assert_eq!(config.admin_agents.len(), 2);
        assert!(config.admin_agents.contains("agent-a"));
        clear_env();
    }

    #[test]
    #[serial]
    fn load_rejects_zero_history_cap() {
        clear_env();
        std::env::set_var("AGENTCOM_HISTORY_CAP", "0");
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn load_rejects_non_numeric_timeout() {
        clear_env();
        std::env::set_var("AGENTCOM_HEARTBEAT_TIMEOUT_MS", "soon");
        let result = Config::load();
        assert!(result.is_err());
        clear_env();
    }
}
