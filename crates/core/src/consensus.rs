//! Reputation-weighted consensus (§4.4).
//!
//! Votes are stored per `(FactId, AgentId)` — one vote per pair, last
//! write wins — and chained twice inside the same write transaction: an
//! `Operation::Vote` entry in the main transaction log
//! ([`crate::ledger::append`]) and an independent hash chain in the
//! `vote_ledger` table ([`append_vote_ledger`]), so a vote, its ledger
//! entry, and its tamper-evidence entry can never diverge.
//!
//! Concurrent votes on different facts never contend; concurrent votes
//! on the *same* `(FactId, AgentId)` pair serialize through a small
//! lock arena ([`LockArena`]) rather than the whole-database writer
//! mutex, since redb already serializes write transactions and the
//! arena only needs to prevent two in-flight callers from racing to
//! read-modify-write the same vote row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use crate::canonical::{chain_hash, GENESIS_HASH};
use crate::error::{Result, StoreError};
use crate::ids::{AgentId, TxId};
use crate::ledger::{self, Operation};
use crate::schema::{AGENTS, CONSENSUS_VOTES, VOTE_LEDGER};
use crate::store;
use crate::types::Confidence;

const REPUTATION_ALPHA: f64 = 0.1;
const REPUTATION_MIN: f64 = 0.05;
const REPUTATION_MAX: f64 = 0.99;
const REPUTATION_DEFAULT: f64 = 0.5;

/// Score cutoffs that drive a fact's [`Confidence`] (§4.4, §6
/// `consensus_thresholds`). Configurable per-engine; these are the
/// spec's own defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusThresholds {
    pub verified: f64,
    pub disputed: f64,
}

impl Default for ConsensusThresholds {
    fn default() -> Self {
        Self { verified: 1.3, disputed: 0.7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub reputation: f64,
    pub registered_at: DateTime<Utc>,
    pub votes_cast: u64,
    /// Votes whose direction matched the fact's resulting confidence
    /// (+1 with a fact that ended `verified`, −1 with `disputed`).
    /// `agree_votes / votes_cast` is the cumulative ratio
    /// [`cast_vote`] smooths the reputation toward.
    pub agree_votes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub fact_id: String,
    pub agent_id: String,
    /// Agreement strength in `[-1.0, 1.0]`: positive supports the fact,
    /// negative disputes it.
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Always `None` today — no signing collaborator exists yet, so
    /// any caller-supplied signature is rejected rather than silently
    /// accepted and ignored (Open Question, resolved in DESIGN.md).
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSummary {
    pub fact_id: String,
    pub score: f64,
    pub confidence: Confidence,
    pub vote_count: u64,
}

/// Register a new agent at `REPUTATION_DEFAULT`, or return the existing
/// one unchanged if `agent_id` is already registered.
pub fn register_agent(
    write_txn: &redb::WriteTransaction,
    agent_id: &AgentId,
    now: DateTime<Utc>,
) -> Result<Agent> {
    let mut table = write_txn.open_table(AGENTS)?;
    if let Some(row) = table.get(agent_id.0.as_str())? {
        return Ok(serde_json::from_str(row.value())?);
    }

    let agent = Agent {
        id: agent_id.clone(),
        reputation: REPUTATION_DEFAULT,
        registered_at: now,
        votes_cast: 0,
        agree_votes: 0,
    };
    table.insert(agent_id.0.as_str(), serde_json::to_string(&agent)?.as_str())?;
    Ok(agent)
}

pub fn get_agent(db: &redb::Database, agent_id: &str) -> Result<Option<Agent>> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(AGENTS)?;
    match table.get(agent_id)? {
        Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
        None => Ok(None),
    }
}

fn vote_key(fact_id: &str, agent_id: &str) -> String {
    format!("{fact_id}:{agent_id}")
}


/// `stated`/`hypothesis` both sit in the open middle band between the
/// two thresholds; a fact that started as a hypothesis stays one until
/// the score actually crosses a threshold (§4.4 step 5).
fn confidence_from_score(score: f64, thresholds: ConsensusThresholds, previous: Confidence) -> Confidence {
    if score >= thresholds.verified {
        Confidence::Verified
    } else if score <= thresholds.disputed {
        Confidence::Disputed
    } else if previous == Confidence::Hypothesis {
        Confidence::Hypothesis
    } else {
        Confidence::Stated
    }
}

/// `consensus_score = 1.0 + Σ(value_i · reputation_i)` over every vote
/// cast on `fact_id`.
pub fn consensus_score(
    write_txn: &redb::WriteTransaction,
    fact_id: &str,
    thresholds: ConsensusThresholds,
) -> Result<ConsensusSummary> {
    let votes_table = write_txn.open_table(CONSENSUS_VOTES)?;
    let agents_table = write_txn.open_table(AGENTS)?;

    let prefix = format!("{fact_id}:");
    let mut score = 1.0;
    let mut vote_count = 0u64;
    for entry in votes_table.range(prefix.as_str()..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        let vote: Vote = serde_json::from_str(v.value())?;
        let weight = match agents_table.get(vote.agent_id.as_str())? {
            Some(row) => serde_json::from_str::<Agent>(row.value())?.reputation,
            None => REPUTATION_DEFAULT,
        };
        score += vote.value * weight;
        vote_count += 1;
    }

    let previous = store::get_in_txn(write_txn, fact_id)?
        .map(|f| f.confidence)
        .unwrap_or(Confidence::Stated);

    Ok(ConsensusSummary {
        fact_id: fact_id.to_string(),
        score,
        confidence: confidence_from_score(score, thresholds, previous),
        vote_count,
    })
}

/// Read-only consensus lookup, used by callers that only want to query
/// a score without joining an in-flight write transaction.
pub fn consensus_of(
    db: &redb::Database,
    fact_id: &str,
    thresholds: ConsensusThresholds,
) -> Result<ConsensusSummary> {
    let read_txn = db.begin_read().map_err(StoreError::from)?;
    let votes_table = read_txn.open_table(CONSENSUS_VOTES)?;
    let agents_table = read_txn.open_table(AGENTS)?;

    let prefix = format!("{fact_id}:");
    let mut score = 1.0;
    let mut vote_count = 0u64;
    for entry in votes_table.range(prefix.as_str()..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        let vote: Vote = serde_json::from_str(v.value())?;
        let weight = match agents_table.get(vote.agent_id.as_str())? {
            Some(row) => serde_json::from_str::<Agent>(row.value())?.reputation,
            None => REPUTATION_DEFAULT,
        };
        score += vote.value * weight;
        vote_count += 1;
    }

    let facts_table = read_txn.open_table(crate::schema::FACTS)?;
    let previous = match facts_table.get(fact_id)? {
        Some(row) => serde_json::from_str::<crate::types::Fact>(row.value())?.confidence,
        None => Confidence::Stated,
    };

    Ok(ConsensusSummary {
        fact_id: fact_id.to_string(),
        score,
        confidence: confidence_from_score(score, thresholds, previous),
        vote_count,
    })
}

/// Does `value`'s direction match the fact's resulting `confidence`
/// (§4.4: +1 agrees with `verified`, −1 agrees with `disputed`)? Votes
/// that land in the open middle band (`stated`/`hypothesis`) never
/// count as agreement either way.
fn agrees_with_outcome(value: f64, confidence: Confidence) -> bool {
    if value > 0.0 {
        confidence == Confidence::Verified
    } else if value < 0.0 {
        confidence == Confidence::Disputed
    } else {
        false
    }
}

/// Record a vote, update the voting agent's reputation, recompute the
/// fact's consensus score, and chain the whole thing into both ledgers
/// — all inside `write_txn`. An `agent_id` that isn't registered yet is
/// auto-registered at `REPUTATION_DEFAULT` rather than rejected (§8).
pub fn cast_vote(
    write_txn: &redb::WriteTransaction,
    vote: Vote,
    thresholds: ConsensusThresholds,
) -> Result<(Agent, ConsensusSummary)> {
    if vote.signature.is_some() {
        return Err(StoreError::InvalidArgument(
            "vote signatures are not supported yet".into(),
        ));
    }
    if !(-1.0..=1.0).contains(&vote.value) {
        return Err(StoreError::InvalidArgument(
            "vote value must be in [-1.0, 1.0]".into(),
        ));
    }

    if store::get_in_txn(write_txn, &vote.fact_id)?.is_none() {
        return Err(StoreError::NotFound(format!("fact {} not found", vote.fact_id)));
    }

    let mut agent: Agent = {
        let agents = write_txn.open_table(AGENTS)?;
        match agents.get(vote.agent_id.as_str())? {
            Some(row) => serde_json::from_str(row.value())?,
            None => Agent {
                id: AgentId::from(vote.agent_id.as_str()),
                reputation: REPUTATION_DEFAULT,
                registered_at: vote.timestamp,
                votes_cast: 0,
                agree_votes: 0,
            },
        }
    };

    {
        let mut votes = write_txn.open_table(CONSENSUS_VOTES)?;
        let key = vote_key(&vote.fact_id, &vote.agent_id);
        votes.insert(key.as_str(), serde_json::to_string(&vote)?.as_str())?;
    }

    // Scored with whatever reputation is already on record for every
    // voter, including this one — `agent`'s own update below happens
    // only after the outcome this vote contributed to is known.
    let summary = consensus_score(write_txn, &vote.fact_id, thresholds)?;

    agent.votes_cast += 1;
    if agrees_with_outcome(vote.value, summary.confidence) {
        agent.agree_votes += 1;
    }
    let agree_ratio = agent.agree_votes as f64 / agent.votes_cast as f64;
    agent.reputation = ((1.0 - REPUTATION_ALPHA) * agent.reputation + REPUTATION_ALPHA * agree_ratio)
        .clamp(REPUTATION_MIN, REPUTATION_MAX);

    {
        let mut agents = write_txn.open_table(AGENTS)?;
        agents.insert(agent.id.0.as_str(), serde_json::to_string(&agent)?.as_str())?;
    }

    let mut fact = store::get_in_txn(write_txn, &vote.fact_id)?
        .expect("checked for existence above");
    fact.confidence = summary.confidence;
    let fact_row = serde_json::to_string(&fact)?;
    {
        let mut facts = write_txn.open_table(crate::schema::FACTS)?;
        facts.insert(fact.id.0.as_str(), fact_row.as_str())?;
    }

    let payload = serde_json::json!({
        "fact_id": vote.fact_id,
        "agent_id": vote.agent_id,
        "value": vote.value,
        "score": summary.score,
        "confidence": summary.confidence.as_str(),
    });
    ledger::append(write_txn, &fact.project, Operation::Vote, payload, vote.timestamp)?;
    append_vote_ledger(write_txn, &vote, vote.timestamp)?;

    Ok((agent, summary))
}

/// One entry in the independent vote-ledger hash chain (§4.4), same
/// hashing discipline as [`crate::ledger::append`] but scoped to votes
/// only and keyed by its own `prev_hash`/`hash` pair rather than the
/// main transaction log's.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VoteLedgerEntry {
    tx_id: String,
    fact_id: String,
    agent_id: String,
    value: f64,
    timestamp: DateTime<Utc>,
    prev_hash: String,
    hash: String,
}

fn vote_ledger_payload(fact_id: &str, agent_id: &str, value: f64) -> serde_json::Value {
    serde_json::json!({
        "fact_id": fact_id,
        "agent_id": agent_id,
        "value": value,
    })
}

fn last_vote_ledger_hash(write_txn: &redb::WriteTransaction) -> Result<String> {
    let table = write_txn.open_table(VOTE_LEDGER)?;
    match table.iter()?.next_back() {
        Some(entry) => {
            let (_k, v) = entry?;
            let row: VoteLedgerEntry = serde_json::from_str(v.value())?;
            Ok(row.hash)
        }
        None => Ok(GENESIS_HASH.to_string()),
    }
}

/// Append one entry to the `vote_ledger` table, chained from the last
/// entry in that table (not the main transaction log's chain).
fn append_vote_ledger(write_txn: &redb::WriteTransaction, vote: &Vote, timestamp: DateTime<Utc>) -> Result<(TxId, String)> {
    let prev_hash = last_vote_ledger_hash(write_txn)?;
    let payload = vote_ledger_payload(&vote.fact_id, &vote.agent_id, vote.value);
    let hash = chain_hash(&prev_hash, &payload, timestamp)?;
    let tx_id = TxId::new();

    let entry = VoteLedgerEntry {
        tx_id: tx_id.0.clone(),
        fact_id: vote.fact_id.clone(),
        agent_id: vote.agent_id.clone(),
        value: vote.value,
        timestamp,
        prev_hash,
        hash: hash.clone(),
    };

    let row = serde_json::to_string(&entry)?;
    let mut table = write_txn.open_table(VOTE_LEDGER)?;
    table.insert(tx_id.0.as_str(), row.as_str())?;
    Ok((tx_id, hash))
}

fn all_vote_ledger_entries(db: &redb::Database) -> Result<Vec<VoteLedgerEntry>> {
    let read_txn = db.begin_read().map_err(StoreError::from)?;
    let table = read_txn.open_table(VOTE_LEDGER)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_k, v) = entry?;
        out.push(serde_json::from_str::<VoteLedgerEntry>(v.value())?);
    }
    out.sort_by(|a, b| a.tx_id.cmp(&b.tx_id));
    Ok(out)
}

/// Walk the vote ledger the way [`ledger::verify_chain`] walks the main
/// transaction log: recompute each entry's hash, confirm `prev_hash`
/// continuity. Never raises for individual violations — they're
/// collected into the returned report.
pub fn verify_vote_ledger(db: &redb::Database) -> Result<ledger::ChainReport> {
    let entries = all_vote_ledger_entries(db)?;
    let mut violations = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let payload = vote_ledger_payload(&entry.fact_id, &entry.agent_id, entry.value);
        let expected_hash = chain_hash(&entry.prev_hash, &payload, entry.timestamp)?;
        if expected_hash != entry.hash {
            violations.push(ledger::Violation {
                tx_id: entry.tx_id.clone(),
                kind: ledger::ViolationKind::HashMismatch,
                expected: expected_hash,
                actual: entry.hash.clone(),
            });
        }

        if i > 0 {
            let prev = &entries[i - 1];
            if entry.prev_hash != prev.hash {
                violations.push(ledger::Violation {
                    tx_id: entry.tx_id.clone(),
                    kind: ledger::ViolationKind::ChainBreak,
                    expected: prev.hash.clone(),
                    actual: entry.prev_hash.clone(),
                });
            }
        } else if entry.prev_hash != GENESIS_HASH {
            violations.push(ledger::Violation {
                tx_id: entry.tx_id.clone(),
                kind: ledger::ViolationKind::ChainBreak,
                expected: GENESIS_HASH.to_string(),
                actual: entry.prev_hash.clone(),
            });
        }
    }

    Ok(ledger::ChainReport {
        valid: violations.is_empty(),
        tx_checked: entries.len() as u64,
        violations,
    })
}

/// Per-`(FactId, AgentId)` lock arena so concurrent votes on the same
/// pair serialize without taking a whole-database lock. Eviction is
/// coarse: [`LockArena::purge_idle`] drops every entry whose `Arc`
/// strong count has fallen back to 1 (nobody but the map itself still
/// holds it), called after each vote releases its guard rather than on
/// a timer.
#[derive(Default)]
pub struct LockArena {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl LockArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, fact_id: &str, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("lock arena poisoned");
        locks
            .entry((fact_id.to_string(), agent_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn purge_idle(&self) {
        let mut locks = self.locks.lock().expect("lock arena poisoned");
        locks.retain(|_, arc| Arc::strong_count(arc) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().expect("lock arena poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;

    fn open_db() -> Database {
        Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .unwrap()
    }

    fn init(db: &Database) {
        let write_txn = db.begin_write().unwrap();
        crate::schema::open_and_migrate(&write_txn).unwrap();
        write_txn.commit().unwrap();
    }

    fn store_fact(db: &Database, content: &str) -> String {
        let write_txn = db.begin_write().unwrap();
        let outcome = store::store(
            &write_txn,
            store::StoreParams {
                project: "demo".into(),
                content: content.into(),
                fact_type: crate::types::FactType::Knowledge,
                tags: Default::default(),
                confidence: Confidence::Stated,
                source: None,
                valid_from: Utc::now(),
                context: None,
                dedup_window: None,
                max_content_bytes: 65536,
            },
            Utc::now(),
        )
        .unwrap();
        write_txn.commit().unwrap();
        match outcome {
            store::StoreOutcome::Inserted(f) => f.id.0,
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn register_agent_is_idempotent() {
        let db = open_db();
        init(&db);
        let write_txn = db.begin_write().unwrap();
        let a1 = register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let a2 = register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        assert_eq!(a1.reputation, a2.reputation);
        assert_eq!(a2.votes_cast, 0);
    }

    #[test]
    fn positive_votes_raise_score_and_reputation() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "water is wet");

        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let (agent, summary) = cast_vote(
            &write_txn,
            Vote {
                fact_id: fact_id.clone(),
                agent_id: "agent-1".into(),
                value: 1.0,
                timestamp: Utc::now(),
                signature: None,
            },
            ConsensusThresholds::default(),
        )
        .unwrap();
        write_txn.commit().unwrap();

        assert!(summary.score > 1.0);
        assert!(agent.reputation > REPUTATION_DEFAULT);
        assert_eq!(agent.votes_cast, 1);
    }

    #[test]
    fn high_enough_score_marks_fact_verified() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "the earth orbits the sun");

        for i in 0..5 {
            let name = format!("agent-{i}");
            let write_txn = db.begin_write().unwrap();
            register_agent(&write_txn, &name.as_str().into(), Utc::now()).unwrap();
            write_txn.commit().unwrap();

            let write_txn = db.begin_write().unwrap();
            cast_vote(
                &write_txn,
                Vote {
                    fact_id: fact_id.clone(),
                    agent_id: name,
                    value: 1.0,
                    timestamp: Utc::now(),
                    signature: None,
                },
                ConsensusThresholds::default(),
            )
            .unwrap();
            write_txn.commit().unwrap();
        }

        let fact = store::get(&db, &fact_id).unwrap().unwrap();
        assert_eq!(fact.confidence, Confidence::Verified);
    }

    #[test]
    fn vote_with_signature_is_rejected() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "x");
        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let err = cast_vote(
            &write_txn,
            Vote {
                fact_id,
                agent_id: "agent-1".into(),
                value: 1.0,
                timestamp: Utc::now(),
                signature: Some("deadbeef".into()),
            },
            ConsensusThresholds::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn vote_out_of_range_is_rejected() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "x");
        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let err = cast_vote(
            &write_txn,
            Vote {
                fact_id,
                agent_id: "agent-1".into(),
                value: 2.5,
                timestamp: Utc::now(),
                signature: None,
            },
            ConsensusThresholds::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn hypothesis_confidence_survives_the_middle_band() {
        let db = open_db();
        init(&db);
        let write_txn = db.begin_write().unwrap();
        let outcome = store::store(
            &write_txn,
            store::StoreParams {
                project: "demo".into(),
                content: "maybe true".into(),
                fact_type: crate::types::FactType::Knowledge,
                tags: Default::default(),
                confidence: Confidence::Hypothesis,
                source: None,
                valid_from: Utc::now(),
                context: None,
                dedup_window: None,
                max_content_bytes: 65536,
            },
            Utc::now(),
        )
        .unwrap();
        write_txn.commit().unwrap();
        let fact_id = match outcome {
            store::StoreOutcome::Inserted(f) => f.id.0,
            _ => panic!("expected insert"),
        };

        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        cast_vote(
            &write_txn,
            Vote {
                fact_id: fact_id.clone(),
                agent_id: "agent-1".into(),
                value: 0.1,
                timestamp: Utc::now(),
                signature: None,
            },
            ConsensusThresholds::default(),
        )
        .unwrap();
        write_txn.commit().unwrap();

        let fact = store::get(&db, &fact_id).unwrap().unwrap();
        assert_eq!(fact.confidence, Confidence::Hypothesis);
    }

    #[test]
    fn revoting_the_same_agent_collapses_to_one_row_not_an_accumulation() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "water boils at 100C at sea level");

        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        for value in [1.0, -1.0, 1.0] {
            let write_txn = db.begin_write().unwrap();
            cast_vote(
                &write_txn,
                Vote {
                    fact_id: fact_id.clone(),
                    agent_id: "agent-1".into(),
                    value,
                    timestamp: Utc::now(),
                    signature: None,
                },
                ConsensusThresholds::default(),
            )
            .unwrap();
            write_txn.commit().unwrap();
        }

        let write_txn = db.begin_write().unwrap();
        let summary = consensus_score(&write_txn, &fact_id, ConsensusThresholds::default()).unwrap();
        write_txn.commit().unwrap();

        // Three casts by the same agent, last value +1.0, must read back as a
        // single vote rather than the sum of all three — reputation has
        // drifted across the three casts, but only the final row counts.
        let agent = get_agent(&db, "agent-1").unwrap().unwrap();
        assert_eq!(summary.vote_count, 1);
        assert_eq!(summary.score, 1.0 + 1.0 * agent.reputation);
    }

    /// §8 scenario 5: an agent that always votes +1 on facts the rest of
    /// the crowd drives to `disputed` never agrees with the outcome, so
    /// its reputation falls toward `REPUTATION_MIN` rather than rising.
    #[test]
    fn always_agreeing_the_wrong_way_drifts_reputation_toward_the_floor() {
        let db = open_db();
        init(&db);

        let write_txn = db.begin_write().unwrap();
        for name in ["disputer-0", "disputer-1", "disputer-2", "disputer-3"] {
            register_agent(&write_txn, &name.into(), Utc::now()).unwrap();
        }
        register_agent(&write_txn, &"agent-x".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        for i in 0..25 {
            let fact_id = store_fact(&db, &format!("contested claim {i}"));

            for name in ["disputer-0", "disputer-1", "disputer-2", "disputer-3"] {
                let write_txn = db.begin_write().unwrap();
                cast_vote(
                    &write_txn,
                    Vote {
                        fact_id: fact_id.clone(),
                        agent_id: name.into(),
                        value: -1.0,
                        timestamp: Utc::now(),
                        signature: None,
                    },
                    ConsensusThresholds::default(),
                )
                .unwrap();
                write_txn.commit().unwrap();
            }

            let write_txn = db.begin_write().unwrap();
            let (_, summary) = cast_vote(
                &write_txn,
                Vote {
                    fact_id: fact_id.clone(),
                    agent_id: "agent-x".into(),
                    value: 1.0,
                    timestamp: Utc::now(),
                    signature: None,
                },
                ConsensusThresholds::default(),
            )
            .unwrap();
            write_txn.commit().unwrap();

            assert_eq!(summary.confidence, Confidence::Disputed);
        }

        let agent_x = get_agent(&db, "agent-x").unwrap().unwrap();
        assert_eq!(agent_x.agree_votes, 0);
        assert_eq!(agent_x.reputation, REPUTATION_MIN);
    }

    #[test]
    fn voting_with_an_unregistered_agent_auto_registers_it() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "water is wet");

        let write_txn = db.begin_write().unwrap();
        let (agent, summary) = cast_vote(
            &write_txn,
            Vote {
                fact_id,
                agent_id: "never-seen-before".into(),
                value: 1.0,
                timestamp: Utc::now(),
                signature: None,
            },
            ConsensusThresholds::default(),
        )
        .unwrap();
        write_txn.commit().unwrap();

        assert_eq!(agent.votes_cast, 1);
        assert!(summary.score > 1.0);
        assert!(get_agent(&db, "never-seen-before").unwrap().is_some());
    }

    #[test]
    fn vote_ledger_chains_independently_of_the_main_ledger() {
        let db = open_db();
        init(&db);
        let fact_id = store_fact(&db, "the moon orbits the earth");

        let write_txn = db.begin_write().unwrap();
        register_agent(&write_txn, &"agent-1".into(), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        for value in [1.0, -1.0, 1.0] {
            let write_txn = db.begin_write().unwrap();
            cast_vote(
                &write_txn,
                Vote {
                    fact_id: fact_id.clone(),
                    agent_id: "agent-1".into(),
                    value,
                    timestamp: Utc::now(),
                    signature: None,
                },
                ConsensusThresholds::default(),
            )
            .unwrap();
            write_txn.commit().unwrap();
        }

        let report = verify_vote_ledger(&db).unwrap();
        assert!(report.valid);
        assert_eq!(report.tx_checked, 3);
    }

    #[test]
    fn lock_arena_evicts_only_unreferenced_entries() {
        let arena = LockArena::new();
        let held = arena.lock_for("f1", "a1");
        {
            let _dropped = arena.lock_for("f2", "a1");
        }
        arena.purge_idle();
        assert_eq!(arena.len(), 1);
        drop(held);
        arena.purge_idle();
        assert_eq!(arena.len(), 0);
    }
}
