//! High-level, ergonomic API over the Trust Engine fact store.
//!
//! This crate is the friendly front door; [`trustengine_core::Engine`]
//! does the actual storage, ledger, and consensus work. Split the same
//! way the corpus this engine is adapted from splits its storage
//! engine from its agent-facing wrapper — one crate owns the database,
//! the other owns the API an agent developer actually wants to call.
//!
//! ```rust,no_run
//! use trustengine::TrustEngine;
//!
//! let memory = TrustEngine::open_in_memory().unwrap();
//!
//! // Store a fact directly
//! let fact = memory.remember("demo", "Rust has no garbage collector", Default::default(), None).unwrap();
//!
//! // Recall everything currently known in a project
//! let facts = memory.recall("demo", "", None, 10).unwrap();
//! assert_eq!(facts.len(), 1);
//! let _ = fact;
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use trustengine_core::{
    CancellationToken, ComplianceReport, Confidence, Engine, EngineConfig, Fact, FactType,
    SearchQuery,
};

pub use trustengine_core::EngineError as Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use trustengine_core::consensus::{Agent, ConsensusSummary};
pub use trustengine_core::ledger::{Certificate, ChainReport, Checkpoint};

/// High-level agent memory store built on a Trust Engine instance.
///
/// This is the entry point agent developers are expected to use;
/// [`trustengine_core::Engine`] remains available directly for callers
/// who need the full seven-argument `store`/`search` surface.
pub struct TrustEngine {
    engine: Engine,
}

impl TrustEngine {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self {
            engine: Engine::open(EngineConfig::at_path(path))?,
        })
    }

    /// Open an ephemeral, in-memory store (tests, scratch agents).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            engine: Engine::open_in_memory()?,
        })
    }

    /// Open with caller-supplied config (custom thresholds, dedup
    /// window, writer queue depth, and so on).
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self { engine: Engine::open(config)? })
    }

    /// The underlying engine, for callers who need the full API.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Store a fact, attaching an embedding in the same call if one is
    /// supplied (so callers don't have to remember to `embed()`
    /// separately for every `remember()`).
    pub fn remember(
        &self,
        project: &str,
        text: &str,
        tags: BTreeSet<String>,
        embedding: Option<Vec<f32>>,
    ) -> Result<Fact> {
        let fact = self.engine.store(
            project,
            text,
            FactType::Knowledge,
            tags,
            Confidence::Stated,
            None,
            None,
            None,
            None,
        )?;
        if let Some(emb) = embedding {
            self.engine.embed(&fact.id.0, &emb)?;
        }
        Ok(fact)
    }

    /// Store a fact with an explicit type, source, and validity start —
    /// the structured counterpart to [`TrustEngine::remember`].
    #[allow(clippy::too_many_arguments)]
    pub fn assert(
        &self,
        project: &str,
        content: &str,
        fact_type: FactType,
        tags: BTreeSet<String>,
        source: Option<String>,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<Fact> {
        self.engine.store(
            project,
            content,
            fact_type,
            tags,
            Confidence::Stated,
            source,
            valid_from,
            None,
            None,
        )
    }

    /// Retrieve matching facts: ranked by embedding similarity when
    /// `query_embedding` is supplied, lexical keyword search when the
    /// `fulltext` feature is enabled and it isn't, otherwise the
    /// project's current facts newest-first.
    #[allow(unused_variables)]
    pub fn recall(
        &self,
        project: &str,
        query: &str,
        query_embedding: Option<&[f32]>,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        if let Some(embedding) = query_embedding {
            let hits = self.engine.search(
                Some(project),
                SearchQuery::Vector(embedding),
                limit,
                false,
                None,
                None,
                None,
            )?;
            return Ok(hits.into_iter().map(|hit| hit.fact).collect());
        }

        #[cfg(feature = "fulltext")]
        {
            return self.engine.search_text(project, query, limit);
        }

        #[cfg(not(feature = "fulltext"))]
        {
            let mut facts = self.engine.recall(project, None)?;
            facts.truncate(limit);
            Ok(facts)
        }
    }

    /// Build a token-bounded prompt context from recalled facts (rough
    /// 1 token ≈ 4 chars, same budget the corpus uses elsewhere for
    /// context assembly).
    pub fn assemble_context(
        &self,
        project: &str,
        query_embedding: Option<&[f32]>,
        max_tokens: usize,
    ) -> Result<String> {
        let facts = self.recall(project, "", query_embedding, 20)?;
        let char_budget = max_tokens.saturating_mul(4);
        let mut context = String::new();

        for fact in &facts {
            let line = format!(
                "[{}] {} · {}\n",
                fact.created_at.format("%Y-%m-%d"),
                fact.fact_type.as_str(),
                fact.content,
            );
            if context.len() + line.len() > char_budget {
                break;
            }
            context.push_str(&line);
        }

        Ok(context)
    }

    /// Soft-deprecate a fact (sets `valid_until`, never removes it).
    pub fn forget(&self, fact_id: &str) -> Result<Fact> {
        self.engine.deprecate(fact_id)
    }

    /// Full lineage for a fact (currently degenerates to one row; see
    /// [`trustengine_core::Engine::history`]).
    pub fn history(&self, fact_id: &str) -> Result<Vec<Fact>> {
        self.engine.history(fact_id)
    }

    pub fn register_agent(&self, agent_id: &str) -> Result<Agent> {
        self.engine.register_agent(agent_id)
    }

    /// Cast a vote on a fact and return the voting agent's updated
    /// reputation plus the fact's refreshed consensus summary.
    pub fn vote(&self, fact_id: &str, agent_id: &str, value: f64) -> Result<(Agent, ConsensusSummary)> {
        self.engine.vote(fact_id, agent_id, value)
    }

    pub fn consensus_of(&self, fact_id: &str) -> Result<ConsensusSummary> {
        self.engine.consensus_of(fact_id)
    }

    /// Tamper-evidence certificate for a single fact.
    pub fn verify(&self, fact_id: &str) -> Result<Certificate> {
        self.engine.verify_fact(fact_id)
    }

    /// Chain + checkpoint integrity summary plus row counts — the
    /// single call an operator runs before trusting an export.
    pub fn compliance_report(&self) -> Result<ComplianceReport> {
        self.engine.compliance_report()
    }

    pub fn cancellation_token() -> CancellationToken {
        CancellationToken::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_then_recall_round_trips() {
        let memory = TrustEngine::open_in_memory().unwrap();
        memory
            .remember("demo", "Alice loves Rust", Default::default(), None)
            .unwrap();

        let facts = memory.recall("demo", "Rust", None, 10).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].content, "Alice loves Rust");
    }

    #[test]
    fn remember_with_embedding_is_findable_by_vector_search() {
        let memory = TrustEngine::open_in_memory().unwrap();
        memory
            .remember("demo", "Rust has a borrow checker", Default::default(), Some(vec![1.0, 0.0, 0.0]))
            .unwrap();
        memory
            .remember("demo", "Python has duck typing", Default::default(), Some(vec![0.0, 1.0, 0.0]))
            .unwrap();

        let facts = memory.recall("demo", "", Some(&[1.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].content.contains("Rust"));
    }

    #[test]
    fn assemble_context_respects_token_budget() {
        let memory = TrustEngine::open_in_memory().unwrap();
        for i in 0..20 {
            memory
                .remember(
                    "demo",
                    &format!("fact number {i} is quite long and wordy indeed"),
                    Default::default(),
                    None,
                )
                .unwrap();
        }

        let ctx = memory.assemble_context("demo", None, 50).unwrap();
        assert!(ctx.len() <= 220);
    }

    #[test]
    fn forget_hides_fact_from_recall() {
        let memory = TrustEngine::open_in_memory().unwrap();
        let fact = memory
            .remember("demo", "temporary note", Default::default(), None)
            .unwrap();
        memory.forget(&fact.id.0).unwrap();

        let facts = memory.recall("demo", "temporary", None, 10).unwrap();
        assert!(facts.is_empty());
    }

    #[test]
    fn vote_and_compliance_report_round_trip() {
        let memory = TrustEngine::open_in_memory().unwrap();
        let fact = memory
            .remember("demo", "the sky is blue", Default::default(), None)
            .unwrap();
        memory.register_agent("agent-1").unwrap();
        let (_, summary) = memory.vote(&fact.id.0, "agent-1", 1.0).unwrap();
        assert!(summary.score > 1.0);

        let report = memory.compliance_report().unwrap();
        assert!(report.chain.valid);
    }
}
