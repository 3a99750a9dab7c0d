//! Repository table (spec §3.3): a thin admin-managed list the Scheduler
//! consults to filter out tasks whose repo is PAUSED. Full CRUD lives on the
//! Admin/HTTP surface; this module owns only the durable record and the
//! filter contract.

use crate::error::{HubError, Result};
use crate::store::DurableStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepoStatus {
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub url: String,
    pub name: String,
    pub status: RepoStatus,
    pub priority_index: i64,
}

enum Command {
    Upsert {
        repo: Repo,
        reply: oneshot::Sender<Result<Repo>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<Repo>>,
    },
    List {
        reply: oneshot::Sender<Vec<Repo>>,
    },
    PausedIds {
        reply: oneshot::Sender<HashSet<String>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct RepoTable {
    tx: mpsc::Sender<Command>,
}

pub fn spawn(store: &DurableStore) -> Result<RepoTable> {
    let table = store.open_table("repos")?;
    let (tx, mut rx) = mpsc::channel::<Command>(64);
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Upsert { repo, reply } => {
                    let result = table.put(&repo.id, &repo).map(|_| repo);
                    let _ = reply.send(result);
                }
                Command::Get { id, reply } => {
                    let _ = reply.send(table.get::<Repo>(&id).ok().flatten());
                }
                Command::List { reply } => {
                    let repos = table.scan::<Repo>().unwrap_or_default().into_iter().map(|(_, r)| r).collect();
                    let _ = reply.send(repos);
                }
                Command::PausedIds { reply } => {
                    let ids = table
                        .scan::<Repo>()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|(_, r)| r.status == RepoStatus::Paused)
                        .map(|(id, _)| id)
                        .collect();
                    let _ = reply.send(ids);
                }
                Command::Delete { id, reply } => {
                    let result = if table.contains(&id).unwrap_or(false) {
                        table.delete(&id).map(|_| ())
                    } else {
                        Err(HubError::NotFound(id.clone()))
                    };
                    let _ = reply.send(result);
                }
            }
        }
    });
    Ok(RepoTable { tx })
}

impl RepoTable {
    pub async fn upsert(&self, repo: Repo) -> Result<Repo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Upsert { repo, reply: reply_tx })
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("repo table actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("repo table actor dropped reply")))?
    }

    pub async fn get(&self, id: &str) -> Option<Repo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::Get { id: id.to_string(), reply: reply_tx }).await.is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }

    pub async fn list(&self) -> Vec<Repo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::List { reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn paused_ids(&self) -> HashSet<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Command::PausedIds { reply: reply_tx }).await.is_err() {
            return HashSet::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Delete { id: id.to_string(), reply: reply_tx })
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("repo table actor unavailable")))?;
        reply_rx
            .await
            .map_err(|_| HubError::Internal(anyhow::anyhow!("repo table actor dropped reply")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn paused_repo_is_reported() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let repos = spawn(&store).unwrap();
        repos
            .upsert(Repo {
                id: "r1".into(),
                url: "https://example.com/r1".into(),
                name: "r1".into(),
                status: RepoStatus::Paused,
                priority_index: 0,
            })
            .await
            .unwrap();
        let paused = repos.paused_ids().await;
        assert!(paused.contains("r1"));
    }

    #[tokio::test]
    async fn delete_missing_repo_errors() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let repos = spawn(&store).unwrap();
        assert!(repos.delete("missing").await.is_err());
    }
}
