//! Redb table layout and forward-only schema migrations.
//!
//! Table constants follow the teacher's `const FACTS: TableDefinition<&str,
//! &str> = TableDefinition::new("facts")` pattern — one constant per
//! table, values stored as canonical-JSON strings wherever the row is
//! a structured type, raw bytes where it's a vector.

use redb::TableDefinition;

pub const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");
pub const FACTS_BY_PROJECT: TableDefinition<&str, &str> = TableDefinition::new("facts_by_project");
pub const DEDUP_INDEX: TableDefinition<&str, &str> = TableDefinition::new("dedup_index");

pub const EMBEDDINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("embeddings");
pub const EMBEDDING_META: TableDefinition<&str, u64> = TableDefinition::new("embedding_meta");

pub const TRANSACTIONS: TableDefinition<&str, &str> = TableDefinition::new("transactions");
pub const MERKLE_ROOTS: TableDefinition<&str, &str> = TableDefinition::new("merkle_roots");

pub const AGENTS: TableDefinition<&str, &str> = TableDefinition::new("agents");
pub const CONSENSUS_VOTES: TableDefinition<&str, &str> = TableDefinition::new("consensus_votes");
pub const VOTE_LEDGER: TableDefinition<&str, &str> = TableDefinition::new("vote_ledger");

pub const INTEGRITY_CHECKS: TableDefinition<&str, &str> = TableDefinition::new("integrity_checks");

pub const SCHEMA_META: TableDefinition<&str, u64> = TableDefinition::new("schema_meta");

/// Current schema version. Bump whenever a migration is appended below.
pub const CURRENT_VERSION: u64 = 1;

/// Open every table so redb creates them if this is a fresh database,
/// then bring the schema up to [`CURRENT_VERSION`].
///
/// Migrations are forward-only: there is no down-migration path,
/// matching the spec's "not a general-purpose database" non-goal. Each
/// migration closure runs inside the same write transaction as the
/// initial table creation, so a partially-applied migration can never
/// be observed — either the whole open succeeds or it rolls back.
pub fn open_and_migrate(write_txn: &redb::WriteTransaction) -> crate::error::Result<()> {
    write_txn.open_table(FACTS)?;
    write_txn.open_table(FACTS_BY_PROJECT)?;
    write_txn.open_table(DEDUP_INDEX)?;
    write_txn.open_table(EMBEDDINGS)?;
    write_txn.open_table(EMBEDDING_META)?;
    write_txn.open_table(TRANSACTIONS)?;
    write_txn.open_table(MERKLE_ROOTS)?;
    write_txn.open_table(AGENTS)?;
    write_txn.open_table(CONSENSUS_VOTES)?;
    write_txn.open_table(VOTE_LEDGER)?;
    write_txn.open_table(INTEGRITY_CHECKS)?;

    let mut meta = write_txn.open_table(SCHEMA_META)?;
    let stored_version = meta.get("version")?.map(|g| g.value()).unwrap_or(0);

    for migration in migrations().into_iter().skip(stored_version as usize) {
        migration(write_txn)?;
    }

    meta.insert("version", CURRENT_VERSION)?;
    Ok(())
}

type Migration = fn(&redb::WriteTransaction) -> crate::error::Result<()>;

/// Ordered migrations, index `i` upgrading schema version `i` to `i + 1`.
/// There is exactly one today (the tables above are version 1); future
/// migrations append here and bump [`CURRENT_VERSION`] — never rewrite
/// an already-shipped entry.
fn migrations() -> Vec<Migration> {
    vec![|_write_txn: &redb::WriteTransaction| -> crate::error::Result<()> { Ok(()) }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::{Database, ReadableDatabase, ReadableTable};

    #[test]
    fn open_and_migrate_sets_current_version() {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .unwrap();
        {
            let write_txn = db.begin_write().unwrap();
            open_and_migrate(&write_txn).unwrap();
            write_txn.commit().unwrap();
        }
        let read_txn = db.begin_read().unwrap();
        let meta = read_txn.open_table(SCHEMA_META).unwrap();
        assert_eq!(meta.get("version").unwrap().unwrap().value(), CURRENT_VERSION);
    }

    #[test]
    fn open_and_migrate_is_idempotent() {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .unwrap();
        for _ in 0..2 {
            let write_txn = db.begin_write().unwrap();
            open_and_migrate(&write_txn).unwrap();
            write_txn.commit().unwrap();
        }
        let read_txn = db.begin_read().unwrap();
        let meta = read_txn.open_table(SCHEMA_META).unwrap();
        assert_eq!(meta.get("version").unwrap().unwrap().value(), CURRENT_VERSION);
    }
}
