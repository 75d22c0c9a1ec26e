//! Append-only, hash-chained transaction log with periodic Merkle
//! checkpoints (§4.3).
//!
//! Writes go through [`append`], which takes an already-open
//! `redb::WriteTransaction` — the same "caller owns the transaction"
//! shape as the teacher's `write_fact_in_txn` — so a fact row and its
//! ledger entry always commit together or not at all. Reads
//! (`verify_chain`, `verify_fact`, `verify_checkpoints`) open their own
//! read transaction and never take the writer lock.

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::canonical::{chain_hash, hash_pair, hex_decode, hex_encode, GENESIS_HASH};
use crate::error::{Result, StoreError};
use crate::ids::{CheckpointId, TxId};
use crate::schema::{FACTS, MERKLE_ROOTS, TRANSACTIONS};
use crate::types::TransactionSummary;

/// Replaces dynamic method resolution for vote/store aggregation
/// (Design Notes): one tagged enum, one fixed payload shape per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Store,
    Deprecate,
    Vote,
    Checkpoint,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Deprecate => "deprecate",
            Self::Vote => "vote",
            Self::Checkpoint => "checkpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    ChainBreak,
    HashMismatch,
    MerkleMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub tx_id: String,
    pub kind: ViolationKind,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
    pub tx_checked: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    pub fact_id: String,
    pub tx_hashes: Vec<String>,
    pub checkpoint_roots: Vec<String>,
    pub membership_verified: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub root_hash: String,
    pub tx_start: String,
    pub tx_end: String,
    pub count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub path: String,
    pub file_hash: String,
    pub merkle_root: String,
    pub count: u64,
}

/// Append one ledger entry inside `write_txn` and return its `(tx_id, hash)`.
///
/// `project` and `payload` become the row's visible content; `payload`
/// is hashed in canonical form together with the previous entry's hash
/// and the timestamp, per §4.3. This function only ever writes the one
/// row — triggering the automatic checkpoint once the backlog crosses
/// `checkpoint_batch` is [`maybe_checkpoint`]'s job, called separately
/// by `Engine` right after `append` inside the same write transaction.
pub fn append(
    write_txn: &redb::WriteTransaction,
    project: &str,
    operation: Operation,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
) -> Result<(TxId, String)> {
    let prev_hash = last_hash_in_txn(write_txn)?;
    let hash = chain_hash(&prev_hash, &payload, timestamp)?;
    let tx_id = TxId::new();

    let summary = TransactionSummary {
        tx_id: tx_id.clone(),
        timestamp,
        project: project.to_string(),
        operation: operation.as_str().to_string(),
        payload,
        prev_hash,
        hash: hash.clone(),
    };

    let row = serde_json::to_string(&summary)?;
    let mut table = write_txn.open_table(TRANSACTIONS)?;
    table.insert(tx_id.0.as_str(), row.as_str())?;

    Ok((tx_id, hash))
}

fn last_hash_in_txn(write_txn: &redb::WriteTransaction) -> Result<String> {
    let table = write_txn.open_table(TRANSACTIONS)?;
    match table.iter()?.next_back() {
        Some(entry) => {
            let (_k, v) = entry?;
            let summary: TransactionSummary = serde_json::from_str(v.value())?;
            Ok(summary.hash)
        }
        None => Ok(GENESIS_HASH.to_string()),
    }
}

fn all_transactions(db: &redb::Database) -> Result<Vec<TransactionSummary>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(TRANSACTIONS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_k, v) = entry?;
        out.push(serde_json::from_str::<TransactionSummary>(v.value())?);
    }
    // Table keys are ULIDs (time-sortable), inserted in order, but
    // iterate-then-sort keeps this correct even if that ever changes.
    out.sort_by(|a, b| a.tx_id.0.cmp(&b.tx_id.0));
    Ok(out)
}

/// Walk every transaction, recompute hashes, confirm `prev_hash`
/// continuity. Never raises for individual violations — they're
/// collected into the returned report (§7 propagation policy).
pub fn verify_chain(db: &redb::Database) -> Result<ChainReport> {
    let txs = all_transactions(db)?;
    let mut violations = Vec::new();

    for (i, tx) in txs.iter().enumerate() {
        let expected_hash = chain_hash(&tx.prev_hash, &tx.payload, tx.timestamp)?;
        if expected_hash != tx.hash {
            violations.push(Violation {
                tx_id: tx.tx_id.0.clone(),
                kind: ViolationKind::HashMismatch,
                expected: expected_hash,
                actual: tx.hash.clone(),
            });
        }

        if i > 0 {
            let prev = &txs[i - 1];
            if tx.prev_hash != prev.hash {
                violations.push(Violation {
                    tx_id: tx.tx_id.0.clone(),
                    kind: ViolationKind::ChainBreak,
                    expected: prev.hash.clone(),
                    actual: tx.prev_hash.clone(),
                });
            }
        } else if tx.prev_hash != GENESIS_HASH {
            violations.push(Violation {
                tx_id: tx.tx_id.0.clone(),
                kind: ViolationKind::ChainBreak,
                expected: GENESIS_HASH.to_string(),
                actual: tx.prev_hash.clone(),
            });
        }
    }

    Ok(ChainReport {
        valid: violations.is_empty(),
        tx_checked: txs.len() as u64,
        violations,
    })
}

/// §8 invariant 4: `tx_id` is strictly increasing. Checked independently
/// of `verify_chain` so `compliance_report` can report it as its own
/// pass/fail line rather than folding it into chain-break violations.
pub fn check_monotonic_tx_ids(db: &redb::Database) -> Result<bool> {
    let txs = all_transactions(db)?;
    Ok(txs.windows(2).all(|w| w[0].tx_id.0 < w[1].tx_id.0))
}

/// §8 invariant 5: row counts in `facts` never shrink — `deprecate`
/// sets `valid_until`, it never removes the row. Confirmed by checking
/// that every fact a logged `deprecate` transaction named still exists.
pub fn check_no_hard_deletes(db: &redb::Database) -> Result<bool> {
    let txs = all_transactions(db)?;
    let read_txn = db.begin_read()?;
    let facts = read_txn.open_table(FACTS)?;
    for tx in &txs {
        if tx.operation == Operation::Deprecate.as_str() {
            if let Some(fact_id) = tx.payload.get("fact_id").and_then(|v| v.as_str()) {
                if facts.get(fact_id)?.is_none() {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Merkle root over `leaves` (already-hashed, raw bytes), odd-duplication
/// rule: an odd level duplicates its last node to pair with itself.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Option<Vec<u8>> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.chunks(2);
        while let Some(pair) = it.next() {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level.into_iter().next()
}

/// Build and persist a Merkle checkpoint over `[tx_start, tx_end]`
/// (inclusive, by `tx_id` ascending), inside the caller's write
/// transaction — called from the same writer-lock scope that appended
/// the transactions being checkpointed.
pub fn create_checkpoint(
    write_txn: &redb::WriteTransaction,
    tx_start: &TxId,
    tx_end: &TxId,
    now: DateTime<Utc>,
) -> Result<Checkpoint> {
    let leaves = {
        let table = write_txn.open_table(TRANSACTIONS)?;
        let mut leaves = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if k.value() < tx_start.0.as_str() || k.value() > tx_end.0.as_str() {
                continue;
            }
            let summary: TransactionSummary = serde_json::from_str(v.value())?;
            let bytes = hex_decode(&summary.hash)
                .ok_or_else(|| StoreError::Storage(format!("corrupt hash for tx {}", k.value())))?;
            leaves.push((k.value().to_string(), bytes));
        }
        leaves.sort_by(|a, b| a.0.cmp(&b.0));
        leaves
    };

    let count = leaves.len() as u64;
    let root = merkle_root(&leaves.into_iter().map(|(_, h)| h).collect::<Vec<_>>())
        .ok_or_else(|| StoreError::InvalidArgument("checkpoint range is empty".into()))?;

    let checkpoint = Checkpoint {
        checkpoint_id: CheckpointId::new(),
        root_hash: hex_encode(&root),
        tx_start: tx_start.0.clone(),
        tx_end: tx_end.0.clone(),
        count,
        created_at: now,
    };

    let row = serde_json::to_string(&checkpoint)?;
    let mut table = write_txn.open_table(MERKLE_ROOTS)?;
    table.insert(checkpoint.checkpoint_id.0.as_str(), row.as_str())?;

    Ok(checkpoint)
}

/// Checkpoint every transaction since the last checkpoint (or genesis,
/// if none exists yet) once that backlog reaches `checkpoint_batch`,
/// then log the checkpoint itself as an `Operation::Checkpoint`
/// transaction. Called from inside the same write transaction and
/// writer-lock scope as the append that may have just crossed the
/// threshold — `Engine::maybe_checkpoint` is the only caller.
///
/// `checkpoint_batch == 0` disables automatic checkpointing.
pub fn maybe_checkpoint(
    write_txn: &redb::WriteTransaction,
    checkpoint_batch: u64,
    now: DateTime<Utc>,
) -> Result<Option<Checkpoint>> {
    if checkpoint_batch == 0 {
        return Ok(None);
    }

    let last_checkpoint_end = {
        let table = write_txn.open_table(MERKLE_ROOTS)?;
        match table.iter()?.next_back() {
            Some(entry) => {
                let (_k, v) = entry?;
                let cp: Checkpoint = serde_json::from_str(v.value())?;
                Some(cp.tx_end)
            }
            None => None,
        }
    };

    // The checkpoint's own log row is excluded from the backlog it
    // triggers the next checkpoint with — otherwise every checkpoint
    // would shrink the next batch by one.
    let pending: Vec<String> = {
        let table = write_txn.open_table(TRANSACTIONS)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let summary: TransactionSummary = serde_json::from_str(v.value())?;
            let after_last_checkpoint = last_checkpoint_end
                .as_deref()
                .is_none_or(|end| k.value() > end);
            if after_last_checkpoint && summary.operation != Operation::Checkpoint.as_str() {
                ids.push(k.value().to_string());
            }
        }
        ids.sort();
        ids
    };

    if (pending.len() as u64) < checkpoint_batch {
        return Ok(None);
    }

    let tx_start = TxId(pending.first().expect("checked non-empty above").clone());
    let tx_end = TxId(pending.last().expect("checked non-empty above").clone());
    let checkpoint = create_checkpoint(write_txn, &tx_start, &tx_end, now)?;

    let payload = serde_json::json!({
        "checkpoint_id": checkpoint.checkpoint_id.0,
        "root_hash": checkpoint.root_hash,
        "tx_start": checkpoint.tx_start,
        "tx_end": checkpoint.tx_end,
        "count": checkpoint.count,
    });
    append(write_txn, "_system", Operation::Checkpoint, payload, now)?;

    Ok(Some(checkpoint))
}

fn all_checkpoints(db: &redb::Database) -> Result<Vec<Checkpoint>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(MERKLE_ROOTS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_k, v) = entry?;
        out.push(serde_json::from_str::<Checkpoint>(v.value())?);
    }
    out.sort_by(|a, b| a.tx_start.cmp(&b.tx_start));
    Ok(out)
}

/// Recompute every stored Merkle root from its `[tx_start, tx_end]`
/// range and compare against the stored value.
pub fn verify_checkpoints(db: &redb::Database) -> Result<ChainReport> {
    let checkpoints = all_checkpoints(db)?;
    let txs = all_transactions(db)?;
    let mut violations = Vec::new();

    for cp in &checkpoints {
        let leaves: Vec<Vec<u8>> = txs
            .iter()
            .filter(|t| t.tx_id.0.as_str() >= cp.tx_start.as_str() && t.tx_id.0.as_str() <= cp.tx_end.as_str())
            .filter_map(|t| hex_decode(&t.hash))
            .collect();

        let recomputed = merkle_root(&leaves).map(|r| hex_encode(&r)).unwrap_or_default();
        if recomputed != cp.root_hash {
            violations.push(Violation {
                tx_id: cp.checkpoint_id.0.clone(),
                kind: ViolationKind::MerkleMismatch,
                expected: cp.root_hash.clone(),
                actual: recomputed,
            });
        }
    }

    Ok(ChainReport {
        valid: violations.is_empty(),
        tx_checked: checkpoints.len() as u64,
        violations,
    })
}

/// Transaction hashes touching `fact_id`, plus the Merkle roots of any
/// checkpoints covering them, with membership recomputed.
pub fn verify_fact(db: &redb::Database, fact_id: &str) -> Result<Certificate> {
    let txs = all_transactions(db)?;
    let matching: Vec<&TransactionSummary> = txs
        .iter()
        .filter(|t| {
            t.payload
                .get("fact_id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| id == fact_id)
        })
        .collect();

    let tx_hashes: Vec<String> = matching.iter().map(|t| t.hash.clone()).collect();

    let checkpoints = all_checkpoints(db)?;
    let mut checkpoint_roots = Vec::new();
    let mut membership_verified = true;

    for tx in &matching {
        if let Some(cp) = checkpoints
            .iter()
            .find(|c| tx.tx_id.0.as_str() >= c.tx_start.as_str() && tx.tx_id.0.as_str() <= c.tx_end.as_str())
        {
            checkpoint_roots.push(cp.root_hash.clone());
            let leaves: Vec<Vec<u8>> = txs
                .iter()
                .filter(|t| t.tx_id.0.as_str() >= cp.tx_start.as_str() && t.tx_id.0.as_str() <= cp.tx_end.as_str())
                .filter_map(|t| hex_decode(&t.hash))
                .collect();
            let recomputed = merkle_root(&leaves).map(|r| hex_encode(&r));
            if recomputed.as_deref() != Some(cp.root_hash.as_str()) {
                membership_verified = false;
            }
        }
    }

    Ok(Certificate {
        fact_id: fact_id.to_string(),
        tx_hashes,
        checkpoint_roots,
        membership_verified,
    })
}

/// Write a canonical JSON export of `[start_tx, end_tx]` (or everything
/// from `start_tx` onward if `end_tx` is `None`) to `path`, alongside a
/// freshly computed Merkle root over the selection. The export itself
/// is not a chained transaction (§4.3) — it is a side file, recorded
/// only in the returned manifest.
pub fn export(
    db: &redb::Database,
    start_tx: &str,
    end_tx: Option<&str>,
    path: &std::path::Path,
) -> Result<ExportManifest> {
    let txs = all_transactions(db)?;
    let selected: Vec<&TransactionSummary> = txs
        .iter()
        .filter(|t| {
            t.tx_id.0.as_str() >= start_tx && end_tx.is_none_or(|end| t.tx_id.0.as_str() <= end)
        })
        .collect();

    let leaves: Vec<Vec<u8>> = selected.iter().filter_map(|t| hex_decode(&t.hash)).collect();
    let root = merkle_root(&leaves).map(|r| hex_encode(&r)).unwrap_or_default();

    let document = serde_json::json!({
        "transactions": selected,
        "merkle_root": root,
        "count": selected.len(),
    });
    let bytes = crate::canonical::canonical_json(&document)?;

    std::fs::write(path, &bytes)
        .map_err(|e| StoreError::Storage(format!("failed writing export file: {e}")))?;

    use sha2::{Digest, Sha256};
    let file_hash = hex_encode(Sha256::digest(&bytes));

    Ok(ExportManifest {
        path: path.to_string_lossy().to_string(),
        file_hash,
        merkle_root: root,
        count: selected.len() as u64,
    })
}
