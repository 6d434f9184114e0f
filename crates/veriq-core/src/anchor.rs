//! Daily Merkle anchors over receipt CIDs.
//!
//! # Tree shape
//!
//! Leaves are taken in insertion order. Domain separation keeps leaf and
//! interior hashes from colliding:
//!
//! ```text
//! leaf = BLAKE3(0x00 || cid)            cid as its ASCII hex bytes
//! node = BLAKE3(0x01 || left || right)
//! ```
//!
//! A level with an odd count pairs its last node with itself. The root of an
//! empty day is `BLAKE3("")`. All hashes are reported as lowercase hex.
//!
//! # Days
//!
//! A receipt belongs to `(issued_at - boundary_offset).date`. Once a day is
//! sealed its anchor never changes; a receipt that would land on a sealed
//! day is filed under the next unsealed one instead.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{PlatformError, Result};
use crate::receipt::{self, IssueKind, Receipt, VerificationReport};
use crate::store::{
    db_err, get_json, next_seq, prefix_end, prefix_start, put_json, Store, ANCHORS,
    DAY_RECEIPTS, RECEIPTS, RECEIPT_DAYS,
};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;
const DAY_SEQ: &str = "day_receipt_seq";
const DAY_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Merkle tree
// ============================================================================

type Hash = [u8; 32];

fn leaf_hash(cid: &str) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(cid.as_bytes());
    *hasher.finalize().as_bytes()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

fn hex(hash: &Hash) -> String {
    blake3::Hash::from(*hash).to_hex().to_string()
}

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            node_hash(left, pair.get(1).unwrap_or(left))
        })
        .collect()
}

/// Root over `cids` in the given order.
pub fn merkle_root(cids: &[String]) -> String {
    if cids.is_empty() {
        return blake3::hash(b"").to_hex().to_string();
    }
    let mut level: Vec<Hash> = cids.iter().map(|c| leaf_hash(c)).collect();
    while level.len() > 1 {
        level = next_level(&level);
    }
    hex(&level[0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    /// Which side the sibling sits on.
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

/// Inclusion proof for the leaf at `index`.
pub fn merkle_proof(cids: &[String], index: usize) -> Option<MerkleProof> {
    if index >= cids.len() {
        return None;
    }
    let mut level: Vec<Hash> = cids.iter().map(|c| leaf_hash(c)).collect();
    let mut pos = index;
    let mut path = Vec::new();
    while level.len() > 1 {
        let (sibling, side) = if pos % 2 == 0 {
            (*level.get(pos + 1).unwrap_or(&level[pos]), Side::Right)
        } else {
            (level[pos - 1], Side::Left)
        };
        path.push(ProofStep {
            sibling: hex(&sibling),
            side,
        });
        level = next_level(&level);
        pos /= 2;
    }
    Some(MerkleProof {
        leaf_index: index,
        path,
    })
}

/// Recompute the root from `cid` and `proof` and compare with `root`.
pub fn verify_proof(cid: &str, proof: &MerkleProof, root: &str) -> bool {
    let mut acc = leaf_hash(cid);
    for step in &proof.path {
        let Ok(sibling) = blake3::Hash::from_hex(&step.sibling) else {
            return false;
        };
        let sibling = *sibling.as_bytes();
        acc = match step.side {
            Side::Left => node_hash(&sibling, &acc),
            Side::Right => node_hash(&acc, &sibling),
        };
    }
    hex(&acc) == root
}

// ============================================================================
// Anchor records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub date: NaiveDate,
    pub merkle_root: String,
    pub receipt_cids: Vec<String>,
    pub sealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub date: NaiveDate,
    pub sealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_root: Option<String>,
    pub rebuilt_root: String,
    pub receipt_count: usize,
    pub matches: bool,
    pub issues: Vec<String>,
}

fn day_key(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn day_prefix(day: NaiveDate) -> (Vec<u8>, Vec<u8>) {
    let key = day_key(day);
    (prefix_start(key.as_bytes()), prefix_end(key.as_bytes()))
}

pub fn parse_day(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, DAY_FORMAT)
        .map_err(|_| PlatformError::AnchorNotFound(format!("bad date '{text}', want YYYY-MM-DD")))
}

/// File a stored receipt under its anchor day. Runs inside the caller's
/// write transaction so the receipt and its day index commit together.
pub(crate) fn file_receipt(
    txn: &WriteTransaction,
    receipt: &Receipt,
    boundary_offset: Duration,
) -> Result<NaiveDate> {
    let mut day = (receipt.body.issued_at - boundary_offset).date_naive();
    {
        let anchors = txn.open_table(ANCHORS).map_err(db_err)?;
        while anchors.get(day_key(day).as_str()).map_err(db_err)?.is_some() {
            day = day
                .succ_opt()
                .ok_or_else(|| PlatformError::Internal("anchor calendar overflow".into()))?;
        }
    }
    let seq = next_seq(txn, DAY_SEQ)?;
    let (mut key, _) = day_prefix(day);
    key.extend_from_slice(&seq.to_be_bytes());
    let mut index = txn.open_table(DAY_RECEIPTS).map_err(db_err)?;
    index
        .insert(key.as_slice(), receipt.cid.as_str())
        .map_err(db_err)?;
    let mut days = txn.open_table(RECEIPT_DAYS).map_err(db_err)?;
    days.insert(receipt.cid.as_str(), day_key(day).as_str())
        .map_err(db_err)?;
    Ok(day)
}

// ============================================================================
// AnchorBook
// ============================================================================

#[derive(Clone)]
pub struct AnchorBook {
    store: Store,
    clock: Arc<dyn Clock>,
    boundary_offset: Duration,
}

impl AnchorBook {
    pub fn new(store: Store, clock: Arc<dyn Clock>, boundary_offset_minutes: i64) -> Self {
        Self {
            store,
            clock,
            boundary_offset: Duration::minutes(boundary_offset_minutes),
        }
    }

    pub fn boundary_offset(&self) -> Duration {
        self.boundary_offset
    }

    pub fn day_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        (ts - self.boundary_offset).date_naive()
    }

    /// Receipt CIDs filed under `day`, in insertion order.
    pub fn receipts_for(&self, day: NaiveDate) -> Result<Vec<String>> {
        let rt = self.store.read()?;
        let index = rt.open_table(DAY_RECEIPTS).map_err(db_err)?;
        let (lo, hi) = day_prefix(day);
        let mut out = Vec::new();
        for entry in index.range(lo.as_slice()..hi.as_slice()).map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            out.push(v.value().to_string());
        }
        Ok(out)
    }

    /// The sealed anchor for `day`, or a provisional one computed from the
    /// receipts filed so far.
    pub fn get(&self, day: NaiveDate) -> Result<AnchorRecord> {
        if let Some(sealed) = self.sealed(day)? {
            return Ok(sealed);
        }
        let cids = self.receipts_for(day)?;
        Ok(AnchorRecord {
            date: day,
            merkle_root: merkle_root(&cids),
            receipt_cids: cids,
            sealed: false,
            sealed_at: None,
        })
    }

    pub fn sealed(&self, day: NaiveDate) -> Result<Option<AnchorRecord>> {
        let rt = self.store.read()?;
        let anchors = rt.open_table(ANCHORS).map_err(db_err)?;
        get_json(&anchors, &day_key(day))
    }

    /// Seal `day`. Sealing an already sealed day returns the stored record.
    pub fn seal(&self, day: NaiveDate) -> Result<AnchorRecord> {
        let txn = self.store.write()?;
        let record = {
            let mut anchors = txn.open_table(ANCHORS).map_err(db_err)?;
            if let Some(existing) = get_json::<AnchorRecord, _>(&anchors, &day_key(day))? {
                return Ok(existing);
            }
            let index = txn.open_table(DAY_RECEIPTS).map_err(db_err)?;
            let (lo, hi) = day_prefix(day);
            let mut cids = Vec::new();
            for entry in index.range(lo.as_slice()..hi.as_slice()).map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                cids.push(v.value().to_string());
            }
            let record = AnchorRecord {
                date: day,
                merkle_root: merkle_root(&cids),
                receipt_cids: cids,
                sealed: true,
                sealed_at: Some(self.clock.now()),
            };
            put_json(&mut anchors, &day_key(day), &record)?;
            record
        };
        txn.commit().map_err(db_err)?;
        tracing::info!(
            date = %record.date,
            receipts = record.receipt_cids.len(),
            root = %record.merkle_root,
            "sealed anchor"
        );
        Ok(record)
    }

    /// Seal every day before the current one that has receipts and is not
    /// sealed yet.
    pub fn seal_due(&self) -> Result<Vec<AnchorRecord>> {
        let today = self.day_of(self.clock.now());
        let mut pending: Vec<NaiveDate> = Vec::new();
        {
            let rt = self.store.read()?;
            let index = rt.open_table(DAY_RECEIPTS).map_err(db_err)?;
            let anchors = rt.open_table(ANCHORS).map_err(db_err)?;
            for entry in index.iter().map_err(db_err)? {
                let (k, _) = entry.map_err(db_err)?;
                let raw = k.value();
                let Some(text) = raw.get(..10).and_then(|b| std::str::from_utf8(b).ok()) else {
                    continue;
                };
                let Ok(day) = NaiveDate::parse_from_str(text, DAY_FORMAT) else {
                    continue;
                };
                if day >= today || pending.last() == Some(&day) {
                    continue;
                }
                if anchors.get(text).map_err(db_err)?.is_none() {
                    pending.push(day);
                }
            }
        }
        pending
            .into_iter()
            .map(|day| self.seal(day))
            .collect::<Result<Vec<_>>>()
    }

    /// Recompute `day` from the receipt index and compare with what is stored.
    pub fn rebuild(&self, day: NaiveDate) -> Result<RebuildReport> {
        let indexed = self.receipts_for(day)?;
        let rebuilt_root = merkle_root(&indexed);
        let sealed = self.sealed(day)?;
        let mut issues = Vec::new();

        {
            let rt = self.store.read()?;
            let receipts = rt.open_table(RECEIPTS).map_err(db_err)?;
            for cid in &indexed {
                if receipts.get(cid.as_str()).map_err(db_err)?.is_none() {
                    issues.push(format!("receipt {cid} is indexed but not stored"));
                }
            }
        }

        let stored_root = sealed.as_ref().map(|s| s.merkle_root.clone());
        if let Some(anchor) = &sealed {
            let from_list = merkle_root(&anchor.receipt_cids);
            if from_list != anchor.merkle_root {
                issues.push(format!(
                    "stored root {} does not match its own receipt list ({from_list})",
                    anchor.merkle_root
                ));
            }
            if anchor.receipt_cids != indexed {
                issues.push(format!(
                    "sealed anchor lists {} receipts, index holds {}",
                    anchor.receipt_cids.len(),
                    indexed.len()
                ));
            }
            if anchor.merkle_root != rebuilt_root {
                issues.push(format!(
                    "rebuilt root {rebuilt_root} differs from sealed root {}",
                    anchor.merkle_root
                ));
            }
        }
        if !issues.is_empty() {
            tracing::warn!(date = %day, issues = issues.len(), "anchor rebuild found mismatches");
        }
        Ok(RebuildReport {
            date: day,
            sealed: sealed.is_some(),
            stored_root,
            rebuilt_root,
            receipt_count: indexed.len(),
            matches: issues.is_empty(),
            issues,
        })
    }

    /// Day a receipt was filed under, if it was filed.
    pub fn day_for_receipt(&self, cid: &str) -> Result<Option<NaiveDate>> {
        let rt = self.store.read()?;
        let days = rt.open_table(RECEIPT_DAYS).map_err(db_err)?;
        let text = match days.get(cid).map_err(db_err)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        Ok(NaiveDate::parse_from_str(&text, DAY_FORMAT).ok())
    }

    /// Inclusion proof for `cid` against its day's anchor (sealed or not).
    pub fn inclusion(&self, cid: &str) -> Result<Option<(AnchorRecord, MerkleProof)>> {
        let Some(day) = self.day_for_receipt(cid)? else {
            return Ok(None);
        };
        let anchor = self.get(day)?;
        let proof = anchor
            .receipt_cids
            .iter()
            .position(|c| c == cid)
            .and_then(|i| merkle_proof(&anchor.receipt_cids, i));
        Ok(proof.map(|p| (anchor, p)))
    }

    /// Add anchor findings to a signature report: when the receipt's day is
    /// sealed, the receipt must be part of it.
    pub fn check_inclusion(&self, receipt: &Receipt, report: &mut VerificationReport) -> Result<()> {
        let Some(day) = self.day_for_receipt(&receipt.cid)? else {
            match receipt::get(&self.store, &receipt.cid) {
                Ok(_) => {}
                Err(PlatformError::ReceiptNotFound(_)) => {
                    report.issue(IssueKind::NotAnchored, "receipt is not in the ledger");
                }
                Err(e) => return Err(e),
            }
            return Ok(());
        };
        report.anchor_date = Some(day_key(day));
        let Some(anchor) = self.sealed(day)? else {
            return Ok(());
        };
        match anchor.receipt_cids.iter().position(|c| c == &receipt.cid) {
            None => report.issue(
                IssueKind::NotAnchored,
                format!("sealed anchor {} does not include this receipt", anchor.date),
            ),
            Some(i) => {
                let proof = merkle_proof(&anchor.receipt_cids, i);
                let ok = proof
                    .as_ref()
                    .is_some_and(|p| verify_proof(&receipt.cid, p, &anchor.merkle_root));
                if !ok {
                    report.issue(
                        IssueKind::AnchorMismatch,
                        format!("inclusion proof fails against root of {}", anchor.date),
                    );
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keyring::ActiveKey;
    use crate::receipt::{ReceiptBody, ReceiptStatus};
    use chrono::TimeZone;

    fn cids(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| blake3::hash(format!("receipt-{i}").as_bytes()).to_hex().to_string())
            .collect()
    }

    #[test]
    fn empty_root_is_hash_of_nothing() {
        assert_eq!(merkle_root(&[]), blake3::hash(b"").to_hex().to_string());
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let c = cids(1);
        assert_eq!(merkle_root(&c), hex(&leaf_hash(&c[0])));
    }

    #[test]
    fn odd_level_duplicates_last() {
        let c = cids(3);
        let l: Vec<Hash> = c.iter().map(|x| leaf_hash(x)).collect();
        let expected = node_hash(&node_hash(&l[0], &l[1]), &node_hash(&l[2], &l[2]));
        assert_eq!(merkle_root(&c), hex(&expected));
    }

    #[test]
    fn root_is_deterministic_and_order_sensitive() {
        let c = cids(5);
        assert_eq!(merkle_root(&c), merkle_root(&c.clone()));
        let mut swapped = c.clone();
        swapped.swap(0, 1);
        assert_ne!(merkle_root(&c), merkle_root(&swapped));
    }

    #[test]
    fn leaf_and_node_domains_differ() {
        // A two-leaf root must not equal a single leaf over the concatenation.
        let c = cids(2);
        let joined = format!("{}{}", c[0], c[1]);
        assert_ne!(merkle_root(&c), merkle_root(&[joined]));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in [1, 2, 3, 4, 7, 8, 9] {
            let c = cids(n);
            let root = merkle_root(&c);
            for (i, cid) in c.iter().enumerate() {
                let proof = merkle_proof(&c, i).unwrap();
                assert!(verify_proof(cid, &proof, &root), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn proof_rejects_other_cid() {
        let c = cids(4);
        let root = merkle_root(&c);
        let proof = merkle_proof(&c, 2).unwrap();
        assert!(!verify_proof(&c[1], &proof, &root));
        assert!(merkle_proof(&c, 4).is_none());
    }

    #[test]
    fn parse_day_accepts_iso_dates_only() {
        assert!(parse_day("2026-01-05").is_ok());
        assert!(parse_day("05/01/2026").is_err());
    }

    fn book() -> (tempfile::TempDir, AnchorBook) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
        ));
        (dir, AnchorBook::new(store, clock, 0))
    }

    fn unfiled_receipt() -> Receipt {
        let body = ReceiptBody {
            work_id: "w1".into(),
            tenant: "acme".into(),
            topic: "vcx:commit".into(),
            status: ReceiptStatus::Done,
            plan_hash: "p".into(),
            idem_key: "p".into(),
            work_hash: "h".into(),
            result_hash: None,
            policy_trace: Vec::new(),
            stage_times: Vec::new(),
            schema_id: "vcx.batch_transcode".into(),
            schema_version: 1,
            artifacts: Vec::new(),
            error: None,
            reassign_count: 0,
            issued_at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap(),
        };
        receipt::issue(body, &ActiveKey::ephemeral("k0001-test")).unwrap()
    }

    #[test]
    fn receipt_missing_from_ledger_is_not_anchored() {
        let (_dir, book) = book();
        let r = unfiled_receipt();
        let mut report = VerificationReport::new(&r.cid);
        book.check_inclusion(&r, &mut report).unwrap();
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::NotAnchored));
    }

    #[test]
    fn unreadable_ledger_entry_is_an_error_not_an_issue() {
        let (_dir, book) = book();
        let r = unfiled_receipt();
        let txn = book.store.write().unwrap();
        {
            let mut receipts = txn.open_table(RECEIPTS).unwrap();
            receipts.insert(r.cid.as_str(), b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let mut report = VerificationReport::new(&r.cid);
        let err = book.check_inclusion(&r, &mut report).unwrap_err();
        assert!(matches!(err, PlatformError::Storage(_)));
        assert!(report.issues.is_empty());
    }
}
