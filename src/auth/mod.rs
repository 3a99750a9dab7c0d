//! 🔐 AUTH REGISTRY: bidirectional agent-id/token mapping, component B.
//! AUDIT CHECKPOINT: this is the hub's primary security boundary — every
//! authenticated HTTP and WebSocket path routes through `verify()`.
//! DECISION ARCHAEOLOGY: the comparison and token shape below are security
//! decisions, not style choices; changing them changes the threat model.
//!
//! Backed by the `tokens` durable table, owned by a single-writer actor
//! (spec §4.B, §9 "single-writer actor around the store"). Grounded in the
//! teacher's `auth_middleware` use of `subtle::ConstantTimeEq` for
//! timing-safe comparison.

use crate::constants::AUTH_TOKEN_BYTES;
use crate::error::{HubError, Result};
use crate::store::{DurableStore, Table};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    agent_id: String,
    token: String,
}

enum Command {
    Issue { agent_id: String, reply: oneshot::Sender<Result<String>> },
    Verify { token: String, reply: oneshot::Sender<Option<String>> },
    Revoke { agent_id: String, reply: oneshot::Sender<Result<bool>> },
}

#[derive(Clone)]
pub struct AuthRegistry {
    tx: mpsc::Sender<Command>,
    admin_agents: std::sync::Arc<HashSet<String>>,
}

pub fn spawn(store: &DurableStore, admin_agents: HashSet<String>) -> Result<AuthRegistry> {
    let table = store.open_table("tokens")?;
    let (tx, mut rx) = mpsc::channel::<Command>(256);
    tokio::spawn(async move { run(table, &mut rx).await });
    Ok(AuthRegistry {
        tx,
        admin_agents: std::sync::Arc::new(admin_agents),
    })
}

async fn run(table: Table, rx: &mut mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Issue { agent_id, reply } => {
                let result = issue(&table, &agent_id);
                if result.is_ok() {
                    info!(%agent_id, "issued auth token");
                }
                let _ = reply.send(result);
            }
            Command::Verify { token, reply } => {
                let result = verify(&table, &token);
                let _ = reply.send(result);
            }
            Command::Revoke { agent_id, reply } => {
                let existed = table.contains(&agent_id).unwrap_or(false);
                let result = table.delete(&agent_id).map(|_| existed);
                if matches!(&result, Ok(true)) {
                    info!(%agent_id, "revoked auth token");
                }
                let _ = reply.send(result);
            }
        }
    }
}

/// 🎲 TOKEN ISSUANCE: cryptographically random bearer token per agent.
/// Why: `rand::thread_rng()` + `AUTH_TOKEN_BYTES` (32 bytes / 256 bits) of
/// entropy, hex-encoded — indistinguishable from random to an attacker and
/// long enough that brute force is not a realistic threat for the life of
/// a deployment.
/// Alternative: a short human-typeable token (rejected: these tokens are
/// only ever handled by agent processes, never typed, so there's no
/// usability cost to maximizing entropy).
fn issue(table: &Table, agent_id: &str) -> Result<String> {
    let mut bytes = [0u8; AUTH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    table.put(
        agent_id,
        &TokenRecord {
            agent_id: agent_id.to_string(),
            token: token.clone(),
        },
    )?;
    Ok(token)
}

/// 🔍 TOKEN VERIFICATION AUDIT CHECKPOINT: every call on this path decides
/// whether a caller gets to act as `agent_id`.
/// SECURITY DECISION: compare with `ConstantTimeEq`, never `==`.
/// Why: a short-circuiting `==` comparison leaks how many leading bytes of
/// the guess matched via response timing, letting an attacker recover a
/// valid token byte-by-byte; constant-time comparison closes that channel.
/// Alternative: hash tokens and compare hashes (rejected: no added value
/// here — the constant-time compare already removes the timing signal, and
/// hashing would only cost CPU without changing the threat model).
///
/// Tables are keyed by agent_id, not token, so verification scans every
/// record. At hub scale (hundreds of agents, not millions) this is cheap;
/// trading a keyed lookup for a full scan is the price of not leaking which
/// agent_id a token belongs to via lookup timing either.
fn verify(table: &Table, candidate: &str) -> Option<String> {
    let records: Vec<(String, TokenRecord)> = table.scan().ok()?;
    for (_, record) in records {
        if bool::from(record.token.as_bytes().ct_eq(candidate.as_bytes())) {
            return Some(record.agent_id);
        }
    }
    None
}

impl AuthRegistry {
    pub async fn issue(&self, agent_id: &str) -> Result<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Issue {
                agent_id: agent_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("auth registry actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("auth registry actor dropped reply")))?
    }

    pub async fn verify(&self, token: &str) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Verify {
                token: token.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn revoke(&self, agent_id: &str) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Revoke {
                agent_id: agent_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("auth registry actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("auth registry actor dropped reply")))?
    }

    pub fn is_admin(&self, agent_id: &str) -> bool {
        self.admin_agents.contains(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_registry() -> (AuthRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let admins = ["root-agent".to_string()].into_iter().collect();
        (spawn(&store, admins).unwrap(), dir)
    }

    #[tokio::test]
    async fn issue_then_verify_round_trips() {
        let (registry, _dir) = test_registry();
        let token = registry.issue("agent-1").await.unwrap();
        let verified = registry.verify(&token).await;
        assert_eq!(verified, Some("agent-1".to_string()));
    }

    #[tokio::test]
    async fn verify_rejects_unknown_token() {
        let (registry, _dir) = test_registry();
        assert_eq!(registry.verify("not-a-real-token").await, None);
    }

    #[tokio::test]
    async fn reissue_overwrites_prior_token() {
        let (registry, _dir) = test_registry();
        let first = registry.issue("agent-1").await.unwrap();
        let second = registry.issue("agent-1").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.verify(&first).await, None);
        assert_eq!(registry.verify(&second).await, Some("agent-1".to_string()));
    }

    #[tokio::test]
    async fn revoke_removes_mapping() {
        let (registry, _dir) = test_registry();
        let token = registry.issue("agent-1").await.unwrap();
        assert!(registry.revoke("agent-1").await.unwrap());
        assert_eq!(registry.verify(&token).await, None);
        assert!(!registry.revoke("agent-1").await.unwrap());
    }

    #[tokio::test]
    async fn is_admin_checks_static_list() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let admins = ["root-agent".to_string()].into_iter().collect();
        let registry = spawn(&store, admins).unwrap();
        assert!(registry.is_admin("root-agent"));
        assert!(!registry.is_admin("agent-1"));
    }
}
