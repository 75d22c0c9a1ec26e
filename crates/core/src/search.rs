//! Embedding index and hybrid search (§4.2).
//!
//! [`VectorIndex`] is the teacher's flat cosine-similarity index,
//! unconditionally compiled here rather than gated behind a feature —
//! embedding search is load-bearing for every `search()` call this
//! engine makes, not an optional add-on. Embeddings are persisted in
//! redb (`embeddings` / `embedding_meta`) exactly the way the teacher's
//! `assert_fact_with_embedding` does it, and the in-memory index is
//! rebuilt from those tables on [`rebuild_index`][rebuild_index] —
//! callers never generate embeddings here, they supply them.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};

use crate::error::{Result, StoreError};
use crate::ids::FactId;
use crate::schema::{EMBEDDINGS, EMBEDDING_META};
use crate::types::Fact;

/// Half-life (in days) for the recency component of the hybrid score,
/// unless the caller overrides it.
pub const DEFAULT_RECENCY_HALF_LIFE_DAYS: f64 = 30.0;

#[derive(Debug, Clone)]
struct Entry {
    id: FactId,
    embedding: Vec<f32>,
}

/// In-memory, brute-force cosine-similarity index. Not persisted
/// itself — [`rebuild_index`] reconstructs it from redb on startup.
#[derive(Debug, Default, Clone)]
pub struct VectorIndex {
    entries: Vec<Entry>,
    dim: Option<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// # Panics
    /// Panics if `embedding` is empty or its dimension differs from the
    /// one established by the first embedding ever inserted.
    pub fn insert(&mut self, id: FactId, embedding: Vec<f32>) {
        assert!(!embedding.is_empty(), "embedding must not be empty");
        match self.dim {
            None => self.dim = Some(embedding.len()),
            Some(d) => assert_eq!(
                embedding.len(),
                d,
                "embedding dimension mismatch: expected {d}, got {}",
                embedding.len()
            ),
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.embedding = embedding;
        } else {
            self.entries.push(Entry { id, embedding });
        }
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cosine similarity of every entry in `valid_ids` against `query`,
    /// unordered — scoring and ranking happen in [`hybrid_search`].
    fn similarities(&self, query: &[f32], valid_ids: &HashSet<FactId>) -> Vec<(FactId, f32)> {
        if valid_ids.is_empty() || self.entries.is_empty() {
            return Vec::new();
        }
        let query_norm = l2_norm(query);
        if query_norm == 0.0 {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|e| valid_ids.contains(&e.id))
            .map(|e| (e.id.clone(), cosine_similarity(query, &e.embedding, query_norm)))
            .collect()
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

/// Persist `embedding` for `fact_id` inside `write_txn`, establishing
/// the index-wide dimension on first use (§4.2 "fixed dimension").
pub fn store_embedding(
    write_txn: &redb::WriteTransaction,
    fact_id: &str,
    embedding: &[f32],
) -> Result<()> {
    if embedding.is_empty() {
        return Err(StoreError::InvalidArgument("embedding must not be empty".into()));
    }

    {
        let mut meta = write_txn.open_table(EMBEDDING_META)?;
        match meta.get("dim")? {
            None => {
                meta.insert("dim", embedding.len() as u64)?;
            }
            Some(g) => {
                let d = g.value();
                if embedding.len() as u64 != d {
                    return Err(StoreError::InvalidArgument(format!(
                        "embedding dimension mismatch: expected {d}, got {}",
                        embedding.len()
                    )));
                }
            }
        }
    }

    let bytes: Vec<u8> = embedding.iter().flat_map(|x| x.to_le_bytes()).collect();
    let mut table = write_txn.open_table(EMBEDDINGS)?;
    table.insert(fact_id, bytes.as_slice())?;
    Ok(())
}

/// Rebuild the in-memory [`VectorIndex`] from the `embeddings` table —
/// called once on `Engine::open`, mirroring the teacher's
/// `rebuild_vector_index_from_db`.
pub fn rebuild_index(db: &redb::Database) -> Result<VectorIndex> {
    let mut idx = VectorIndex::new();
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(EMBEDDINGS) {
        Ok(t) => t,
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(idx),
        Err(e) => return Err(StoreError::from(e)),
    };

    for entry in table.iter()? {
        let (k, v) = entry?;
        let bytes = v.value();
        if bytes.len() % 4 != 0 {
            return Err(StoreError::Storage(format!(
                "corrupt embedding for fact {}: byte length {} is not a multiple of 4",
                k.value(),
                bytes.len()
            )));
        }
        let embedding: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        idx.insert(FactId(k.value().to_string()), embedding);
    }

    Ok(idx)
}

/// Recency component: `exp(-Δt / half_life)`, `Δt` in days.
fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, half_life_days: f64) -> f32 {
    let delta_days = now.signed_duration_since(created_at).num_seconds() as f64 / 86_400.0;
    let delta_days = delta_days.max(0.0);
    (-delta_days / half_life_days).exp() as f32
}

/// Consensus component, compressed into `[0.25, 2.0]` so a single wild
/// vote can't dominate the hybrid score (§4.2).
fn consensus_scale(consensus_score: f64) -> f32 {
    let scaled = consensus_score / (1.0 + (consensus_score - 1.0).abs());
    scaled.clamp(0.25, 2.0) as f32
}

#[derive(Debug, Clone)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f32,
}

/// Rank `candidates` (already filtered to the caller's visibility
/// window) against `query` using
/// `score = (0.70·s_cos + 0.30·s_rec) · s_cons`, where
/// `s_cos = (cosine + 1) / 2` and `s_rec = exp(-Δt / half_life)`.
/// `consensus_of` supplies each fact's current consensus score.
pub fn hybrid_search(
    index: &VectorIndex,
    candidates: &[Fact],
    query: &[f32],
    now: DateTime<Utc>,
    half_life_days: f64,
    limit: usize,
    consensus_of: impl Fn(&FactId) -> f64,
) -> Vec<ScoredFact> {
    let valid_ids: HashSet<FactId> = candidates.iter().map(|f| f.id.clone()).collect();
    let similarities = index.similarities(query, &valid_ids);
    let by_fact: std::collections::HashMap<FactId, f32> = similarities.into_iter().collect();

    let mut scored: Vec<ScoredFact> = candidates
        .iter()
        .filter_map(|fact| {
            let cosine = *by_fact.get(&fact.id)?;
            let s_cos = (cosine + 1.0) / 2.0;
            let s_rec = recency_score(fact.created_at, now, half_life_days);
            let s_cons = consensus_scale(consensus_of(&fact.id));
            let score = (0.70 * s_cos + 0.30 * s_rec) * s_cons;
            Some(ScoredFact {
                fact: fact.clone(),
                score,
            })
        })
        .collect();

    // Ties break by most recent `created_at`, then by lower `fact_id`,
    // so two facts with identical scores still return in a stable,
    // deterministic order across calls.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.fact.created_at.cmp(&a.fact.created_at))
            .then_with(|| a.fact.id.cmp(&b.fact.id))
    });
    scored.truncate(limit);
    scored
}

/// Breadth-first expansion over shared tags and `Bridge`-type facts,
/// up to `max_depth` hops from `seed_ids`. Used to widen a recall or
/// search result set with facts the query embedding alone would miss
/// (two facts tagged identically, or a bridge fact explicitly linking
/// two projects).
pub fn graph_expand(all_facts: &[Fact], seed_ids: &[FactId], max_depth: usize) -> Vec<FactId> {
    let mut visited: HashSet<FactId> = seed_ids.iter().cloned().collect();
    let mut frontier: VecDeque<(FactId, usize)> = seed_ids.iter().cloned().map(|id| (id, 0)).collect();
    let mut discovered = Vec::new();

    while let Some((id, depth)) = frontier.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let Some(fact) = all_facts.iter().find(|f| f.id == id) else {
            continue;
        };
        for neighbor in all_facts.iter().filter(|other| {
            other.id != fact.id
                && !visited.contains(&other.id)
                && !other.tags.is_disjoint(&fact.tags)
                && !fact.tags.is_empty()
        }) {
            visited.insert(neighbor.id.clone());
            discovered.push(neighbor.id.clone());
            frontier.push_back((neighbor.id.clone(), depth + 1));
        }
    }

    discovered
}
