//! Fact storage and retrieval (§4.1).
//!
//! Every write here runs inside a caller-supplied `redb::WriteTransaction`
//! so a fact row, its project index entry, its dedup index entry, and
//! its ledger entry ([`crate::ledger::append`]) commit atomically — the
//! same "one transaction, several tables" shape as the teacher's
//! `write_fact_in_txn`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use sha2::{Digest, Sha256};

use crate::canonical::hex_encode;
use crate::error::{Result, StoreError};
use crate::ids::FactId;
use crate::schema::{DEDUP_INDEX, FACTS, FACTS_BY_PROJECT};
use crate::types::{Confidence, Fact, FactType};

/// Composite key mirroring the teacher's `"{subject}:{predicate}:{id}"`
/// trick: prefix-scannable by project, still unique per fact.
fn project_index_key(project: &str, fact_id: &str) -> String {
    format!("{project}:{fact_id}")
}

fn dedup_key(project: &str, content: &str, fact_type: FactType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project.as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    hasher.update(b"\0");
    hasher.update(fact_type.as_str().as_bytes());
    hex_encode(hasher.finalize())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct DedupEntry {
    fact_id: String,
    created_at: DateTime<Utc>,
}

/// Parameters accepted by [`store`]. Everything but `project`,
/// `content`, and `fact_type` has a spec-defined default, applied by
/// the caller (`Engine::store`) before this function ever sees them.
pub struct StoreParams {
    pub project: String,
    pub content: String,
    pub fact_type: FactType,
    pub tags: BTreeSet<String>,
    pub confidence: Confidence,
    pub source: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub context: Option<serde_json::Value>,
    /// `None` disables de-duplication for this call.
    pub dedup_window: Option<chrono::Duration>,
    /// Hard cap on `content`'s byte length (§6 `max_content_bytes`).
    pub max_content_bytes: usize,
}

pub enum StoreOutcome {
    Inserted(Fact),
    Deduplicated(FactId),
}

/// Insert a fact, honoring the de-duplication window (§4.1): if a fact
/// with the same `(project, content, fact_type)` hash was stored within
/// `dedup_window` of `now`, the existing fact's id is returned instead
/// of inserting a duplicate row.
pub fn store(
    write_txn: &redb::WriteTransaction,
    params: StoreParams,
    now: DateTime<Utc>,
) -> Result<StoreOutcome> {
    if params.project.trim().is_empty() {
        return Err(StoreError::InvalidArgument("project must not be empty".into()));
    }
    if params.content.trim().is_empty() {
        return Err(StoreError::InvalidArgument("fact content must not be empty".into()));
    }
    if params.content.len() > params.max_content_bytes {
        return Err(StoreError::InvalidArgument(format!(
            "fact content exceeds max_content_bytes ({} > {})",
            params.content.len(),
            params.max_content_bytes
        )));
    }

    let key = dedup_key(&params.project, &params.content, params.fact_type);

    if let Some(window) = params.dedup_window {
        let dedup_table = write_txn.open_table(DEDUP_INDEX)?;
        if let Some(existing) = dedup_table.get(key.as_str())? {
            let entry: DedupEntry = serde_json::from_str(existing.value())?;
            if now.signed_duration_since(entry.created_at) <= window {
                return Ok(StoreOutcome::Deduplicated(FactId(entry.fact_id)));
            }
        }
    }

    let fact = Fact {
        id: FactId::new(),
        project: params.project,
        content: params.content,
        fact_type: params.fact_type,
        tags: params.tags,
        confidence: params.confidence,
        source: params.source,
        created_at: now,
        valid_from: params.valid_from,
        valid_until: None,
        context: params.context,
    };

    let row = serde_json::to_string(&fact)?;
    {
        let mut facts = write_txn.open_table(FACTS)?;
        facts.insert(fact.id.0.as_str(), row.as_str())?;
    }
    {
        let mut by_project = write_txn.open_table(FACTS_BY_PROJECT)?;
        let index_key = project_index_key(&fact.project, &fact.id.0);
        by_project.insert(index_key.as_str(), fact.id.0.as_str())?;
    }
    {
        let mut dedup_table = write_txn.open_table(DEDUP_INDEX)?;
        let entry = DedupEntry {
            fact_id: fact.id.0.clone(),
            created_at: now,
        };
        dedup_table.insert(key.as_str(), serde_json::to_string(&entry)?.as_str())?;
    }

    Ok(StoreOutcome::Inserted(fact))
}

/// Set `valid_until` on a fact (soft delete, §4.1) — never removes the
/// row, so history and the ledger stay intact.
pub fn deprecate(
    write_txn: &redb::WriteTransaction,
    fact_id: &str,
    now: DateTime<Utc>,
) -> Result<Fact> {
    let mut fact = get_in_txn(write_txn, fact_id)?
        .ok_or_else(|| StoreError::NotFound(format!("fact {fact_id} not found")))?;

    if fact.valid_until.is_some() {
        return Err(StoreError::Conflict(format!("fact {fact_id} is already deprecated")));
    }

    fact.valid_until = Some(now);
    let row = serde_json::to_string(&fact)?;
    let mut facts = write_txn.open_table(FACTS)?;
    facts.insert(fact.id.0.as_str(), row.as_str())?;
    Ok(fact)
}

pub fn get_in_txn(write_txn: &redb::WriteTransaction, fact_id: &str) -> Result<Option<Fact>> {
    let facts = write_txn.open_table(FACTS)?;
    match facts.get(fact_id)? {
        Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
        None => Ok(None),
    }
}

pub fn get(db: &redb::Database, fact_id: &str) -> Result<Option<Fact>> {
    let read_txn = db.begin_read()?;
    let facts = read_txn.open_table(FACTS)?;
    match facts.get(fact_id)? {
        Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
        None => Ok(None),
    }
}

/// All facts for `project` visible at `at`, newest `created_at` first.
pub fn recall(db: &redb::Database, project: &str, at: DateTime<Utc>) -> Result<Vec<Fact>> {
    let read_txn = db.begin_read()?;
    let by_project = read_txn.open_table(FACTS_BY_PROJECT)?;
    let facts_table = read_txn.open_table(FACTS)?;

    let prefix = format!("{project}:");
    let mut out = Vec::new();
    for entry in by_project.range(prefix.as_str()..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        if let Some(row) = facts_table.get(v.value())? {
            let fact: Fact = serde_json::from_str(row.value())?;
            if fact.visible_at(at) {
                out.push(fact);
            }
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

/// Every visible fact across every project, newest `created_at` first —
/// the project-unscoped counterpart to [`recall`], used by
/// [`crate::engine::Engine::search`] when no `project` filter is given.
pub fn recall_all(db: &redb::Database, at: DateTime<Utc>) -> Result<Vec<Fact>> {
    let read_txn = db.begin_read()?;
    let facts_table = read_txn.open_table(FACTS)?;

    let mut out = Vec::new();
    for entry in facts_table.iter()? {
        let (_k, v) = entry?;
        let fact: Fact = serde_json::from_str(v.value())?;
        if fact.visible_at(at) {
            out.push(fact);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

/// Every version of a fact's lineage the store has ever recorded. The
/// current engine keeps exactly one row per `FactId` (deprecation is
/// in-place), so this degenerates to a one- or zero-element vector
/// until corrections grow a proper version chain.
pub fn history(db: &redb::Database, fact_id: &str) -> Result<Vec<Fact>> {
    Ok(get(db, fact_id)?.into_iter().collect())
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

    fn params(project: &str, content: &str) -> StoreParams {
        StoreParams {
            project: project.to_string(),
            content: content.to_string(),
            fact_type: FactType::Knowledge,
            tags: BTreeSet::new(),
            confidence: Confidence::Stated,
            source: None,
            valid_from: Utc::now(),
            context: None,
            dedup_window: Some(chrono::Duration::minutes(5)),
            max_content_bytes: 65536,
        }
    }

    #[test]
    fn store_then_get_round_trips() {
        let db = open_db();
        init(&db);
        let write_txn = db.begin_write().unwrap();
        let outcome = store(&write_txn, params("demo", "the sky is blue"), Utc::now()).unwrap();
        write_txn.commit().unwrap();

        let fact = match outcome {
            StoreOutcome::Inserted(f) => f,
            _ => panic!("expected insert"),
        };
        let fetched = get(&db, &fact.id.0).unwrap().unwrap();
        assert_eq!(fetched.content, "the sky is blue");
    }

    #[test]
    fn duplicate_within_window_is_deduplicated() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        let write_txn = db.begin_write().unwrap();
        let first = store(&write_txn, params("demo", "dup"), now).unwrap();
        write_txn.commit().unwrap();
        let first_id = match first {
            StoreOutcome::Inserted(f) => f.id,
            _ => panic!("expected insert"),
        };

        let write_txn = db.begin_write().unwrap();
        let second = store(&write_txn, params("demo", "dup"), now + chrono::Duration::seconds(1)).unwrap();
        write_txn.commit().unwrap();

        match second {
            StoreOutcome::Deduplicated(id) => assert_eq!(id, first_id),
            _ => panic!("expected dedup"),
        }
    }

    #[test]
    fn duplicate_outside_window_inserts_new_fact() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        let write_txn = db.begin_write().unwrap();
        store(&write_txn, params("demo", "dup"), now).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let second = store(&write_txn, params("demo", "dup"), now + chrono::Duration::minutes(10)).unwrap();
        write_txn.commit().unwrap();

        assert!(matches!(second, StoreOutcome::Inserted(_)));
    }

    #[test]
    fn deprecate_sets_valid_until_and_hides_from_recall() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        let write_txn = db.begin_write().unwrap();
        let outcome = store(&write_txn, params("demo", "temp fact"), now).unwrap();
        write_txn.commit().unwrap();
        let fact_id = match outcome {
            StoreOutcome::Inserted(f) => f.id,
            _ => panic!("expected insert"),
        };

        let write_txn = db.begin_write().unwrap();
        deprecate(&write_txn, &fact_id.0, now + chrono::Duration::seconds(1)).unwrap();
        write_txn.commit().unwrap();

        let visible = recall(&db, "demo", now + chrono::Duration::seconds(2)).unwrap();
        assert!(visible.is_empty());

        let historical = recall(&db, "demo", now).unwrap();
        assert_eq!(historical.len(), 1);
    }

    #[test]
    fn deprecate_twice_is_a_conflict() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        let write_txn = db.begin_write().unwrap();
        let outcome = store(&write_txn, params("demo", "x"), now).unwrap();
        write_txn.commit().unwrap();
        let fact_id = match outcome {
            StoreOutcome::Inserted(f) => f.id,
            _ => panic!("expected insert"),
        };

        let write_txn = db.begin_write().unwrap();
        deprecate(&write_txn, &fact_id.0, now).unwrap();
        write_txn.commit().unwrap();

        let write_txn = db.begin_write().unwrap();
        let err = deprecate(&write_txn, &fact_id.0, now).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn recall_orders_newest_first_and_scopes_by_project() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        for (project, content, offset) in [
            ("demo", "first", 0),
            ("demo", "second", 1),
            ("other", "unrelated", 2),
        ] {
            let write_txn = db.begin_write().unwrap();
            store(
                &write_txn,
                params(project, content),
                now + chrono::Duration::seconds(offset),
            )
            .unwrap();
            write_txn.commit().unwrap();
        }

        let facts = recall(&db, "demo", now + chrono::Duration::minutes(1)).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].content, "second");
        assert_eq!(facts[1].content, "first");
    }

    #[test]
    fn recall_all_spans_every_project() {
        let db = open_db();
        init(&db);
        let now = Utc::now();

        for (project, content) in [("demo", "first"), ("other", "second")] {
            let write_txn = db.begin_write().unwrap();
            store(&write_txn, params(project, content), now).unwrap();
            write_txn.commit().unwrap();
        }

        let facts = recall_all(&db, now + chrono::Duration::minutes(1)).unwrap();
        assert_eq!(facts.len(), 2);
    }

    #[test]
    fn empty_content_is_rejected() {
        let db = open_db();
        init(&db);
        let write_txn = db.begin_write().unwrap();
        let err = store(&write_txn, params("demo", "   "), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn empty_project_is_rejected() {
        let db = open_db();
        init(&db);
        let write_txn = db.begin_write().unwrap();
        let err = store(&write_txn, params("   ", "x"), Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn content_over_max_bytes_is_rejected() {
        let db = open_db();
        init(&db);
        let mut p = params("demo", "x");
        p.content = "a".repeat(10);
        p.max_content_bytes = 5;
        let write_txn = db.begin_write().unwrap();
        let err = store(&write_txn, p, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
