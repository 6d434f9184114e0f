//! The redb database shared by the queue, receipt ledger, anchors, key table
//! and event log.
//!
//! # Table design
//!
//! Ordered scans use composite big-endian byte keys so byte order equals the
//! order we want to read in:
//!
//! ```text
//! READY         [ topic bytes | 0x1F | seq: u64 BE ]            -> work_id
//! DAY_RECEIPTS  [ "YYYY-MM-DD" | 0x1F | seq: u64 BE ]           -> receipt cid
//! EVENTS        [ work_id bytes | 0x1F | seq: u32 BE ]          -> event JSON
//! ```
//!
//! A range scan over a prefix (`prefix..prefix_end`) therefore yields ready
//! work in enqueue order, a day's receipts in insertion order, and a work
//! item's events in append order.
//!
//! Every state transition runs in one write transaction. redb admits a
//! single writer at a time, which makes per-work-id transitions
//! linearizable without any in-process locking.

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PlatformError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// work_id -> JSON `QueuedWork`
pub(crate) const WORK: TableDefinition<&str, &[u8]> = TableDefinition::new("work");
/// topic ++ 0x1F ++ seq -> work_id
pub(crate) const READY: TableDefinition<&[u8], &str> = TableDefinition::new("ready");
/// work_id -> lease expiry (unix ms)
pub(crate) const LEASED: TableDefinition<&str, u64> = TableDefinition::new("leased");
/// tenant ++ 0x1F ++ idem_key -> JSON `CommitRecord`
pub(crate) const COMMITS: TableDefinition<&str, &[u8]> = TableDefinition::new("commits");
/// plan_hash -> commit key of the first commit of that plan
pub(crate) const PLAN_COMMITS: TableDefinition<&str, &str> = TableDefinition::new("plan_commits");
/// receipt cid -> JSON `Receipt`
pub(crate) const RECEIPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("receipts");
/// receipt cid -> anchor day it was filed under
pub(crate) const RECEIPT_DAYS: TableDefinition<&str, &str> = TableDefinition::new("receipt_days");
/// day ++ seq -> receipt cid
pub(crate) const DAY_RECEIPTS: TableDefinition<&[u8], &str> =
    TableDefinition::new("day_receipts");
/// day -> JSON `AnchorRecord` (sealed days only)
pub(crate) const ANCHORS: TableDefinition<&str, &[u8]> = TableDefinition::new("anchors");
/// kid -> JSON stored key
pub(crate) const SIGNING_KEYS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("signing_keys");
/// work_id ++ 0x1F ++ seq -> JSON `WorkEvent`
pub(crate) const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");
/// named counters
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const KEY_SEP: u8 = 0x1f;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the platform database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open or create the database at `path` and make sure every table
    /// exists before any reads.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(WORK).map_err(db_err)?;
        wt.open_table(READY).map_err(db_err)?;
        wt.open_table(LEASED).map_err(db_err)?;
        wt.open_table(COMMITS).map_err(db_err)?;
        wt.open_table(PLAN_COMMITS).map_err(db_err)?;
        wt.open_table(RECEIPTS).map_err(db_err)?;
        wt.open_table(RECEIPT_DAYS).map_err(db_err)?;
        wt.open_table(DAY_RECEIPTS).map_err(db_err)?;
        wt.open_table(ANCHORS).map_err(db_err)?;
        wt.open_table(SIGNING_KEYS).map_err(db_err)?;
        wt.open_table(EVENTS).map_err(db_err)?;
        wt.open_table(META).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        tracing::debug!(path = %path.display(), "store opened");
        Ok(Self { db: Arc::new(db) })
    }

    pub(crate) fn write(&self) -> Result<WriteTransaction> {
        self.db.begin_write().map_err(db_err)
    }

    pub(crate) fn read(&self) -> Result<ReadTransaction> {
        self.db.begin_read().map_err(db_err)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn db_err(e: impl std::fmt::Display) -> PlatformError {
    PlatformError::Storage(e.to_string())
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(db_err)
}

pub(crate) fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(db_err)
}

/// Read and decode a JSON value from any readable `&str`-keyed table.
pub(crate) fn get_json<T, Tbl>(table: &Tbl, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    Tbl: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(db_err)? {
        Some(guard) => Ok(Some(from_json(guard.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = to_json(value)?;
    table.insert(key, bytes.as_slice()).map_err(db_err)?;
    Ok(())
}

/// Increment the named counter and return the new value (first call returns 1).
pub(crate) fn next_seq(txn: &WriteTransaction, name: &str) -> Result<u64> {
    let mut meta = txn.open_table(META).map_err(db_err)?;
    let current = meta.get(name).map_err(db_err)?.map(|g| g.value()).unwrap_or(0);
    let next = current + 1;
    meta.insert(name, next).map_err(db_err)?;
    Ok(next)
}

/// `prefix ++ 0x1F`, the lower bound of a composite-key prefix scan.
pub(crate) fn prefix_start(prefix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1);
    key.extend_from_slice(prefix);
    key.push(KEY_SEP);
    key
}

/// `prefix ++ 0x20`, the exclusive upper bound matching `prefix_start`.
pub(crate) fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1);
    key.extend_from_slice(prefix);
    key.push(KEY_SEP + 1);
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn counters_start_at_one_and_increase() {
        let (_dir, store) = open_tmp();
        let txn = store.write().unwrap();
        assert_eq!(next_seq(&txn, "work_seq").unwrap(), 1);
        assert_eq!(next_seq(&txn, "work_seq").unwrap(), 2);
        assert_eq!(next_seq(&txn, "other").unwrap(), 1);
        txn.commit().unwrap();

        let txn = store.write().unwrap();
        assert_eq!(next_seq(&txn, "work_seq").unwrap(), 3);
    }

    #[test]
    fn prefix_bounds_exclude_longer_topics() {
        let (_dir, store) = open_tmp();
        let txn = store.write().unwrap();
        {
            let mut ready = txn.open_table(READY).unwrap();
            let mut a = prefix_start(b"vcx");
            a.extend_from_slice(&1u64.to_be_bytes());
            let mut b = prefix_start(b"vcx:commit");
            b.extend_from_slice(&2u64.to_be_bytes());
            ready.insert(a.as_slice(), "a").unwrap();
            ready.insert(b.as_slice(), "b").unwrap();
        }
        txn.commit().unwrap();

        let rt = store.read().unwrap();
        let ready = rt.open_table(READY).unwrap();
        let lo = prefix_start(b"vcx");
        let hi = prefix_end(b"vcx");
        let hits: Vec<String> = ready
            .range(lo.as_slice()..hi.as_slice())
            .unwrap()
            .map(|e| e.unwrap().1.value().to_string())
            .collect();
        assert_eq!(hits, vec!["a"]);
    }

    #[test]
    fn json_helpers_round_trip_through_a_table() {
        let (_dir, store) = open_tmp();
        let txn = store.write().unwrap();
        {
            let mut t = txn.open_table(WORK).unwrap();
            put_json(&mut t, "w1", &serde_json::json!({"n": 1})).unwrap();
        }
        txn.commit().unwrap();
        let rt = store.read().unwrap();
        let t = rt.open_table(WORK).unwrap();
        let v: Option<serde_json::Value> = get_json(&t, "w1").unwrap();
        assert_eq!(v.unwrap()["n"], 1);
        let none: Option<serde_json::Value> = get_json(&t, "nope").unwrap();
        assert!(none.is_none());
    }
}
