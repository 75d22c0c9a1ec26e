//! Core value types: [`Fact`], its enumerated fields, and the vote/
//! consensus primitives that ride alongside it.
//!
//! Bitemporal shape mirrors the teacher's `Fact`: a `created_at`
//! (transaction time, when we learned it) plus a `valid_from`/
//! `valid_until` validity window (when it was true), except here
//! `valid_until` is set at most once (soft-deprecation, never
//! cleared) rather than replaced by a correction the way the
//! teacher's `valid_to` is.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::FactId;

/// Canonical spelling for the spec's `mistake`/`error` duplication
/// (Open Question, resolved in DESIGN.md): `Mistake` is the only
/// variant that exists; historical rows spelled `error` are not
/// reconciled by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactType {
    Axiom,
    Knowledge,
    Decision,
    Mistake,
    Bridge,
    Ghost,
    Rule,
    Schema,
    Task,
}

impl FactType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "axiom" => Some(Self::Axiom),
            "knowledge" => Some(Self::Knowledge),
            "decision" => Some(Self::Decision),
            // `error` is accepted on input and canonicalized to `Mistake`
            // so historical callers aren't broken by the rename.
            "mistake" | "error" => Some(Self::Mistake),
            "bridge" => Some(Self::Bridge),
            "ghost" => Some(Self::Ghost),
            "rule" => Some(Self::Rule),
            "schema" => Some(Self::Schema),
            "task" => Some(Self::Task),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Axiom => "axiom",
            Self::Knowledge => "knowledge",
            Self::Decision => "decision",
            Self::Mistake => "mistake",
            Self::Bridge => "bridge",
            Self::Ghost => "ghost",
            Self::Rule => "rule",
            Self::Schema => "schema",
            Self::Task => "task",
        }
    }
}

/// Confidence state machine driven by consensus (§4.4). Starts at
/// `Stated` (or `Hypothesis` if set explicitly at creation) and is
/// mutated only by [`crate::consensus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Stated,
    Verified,
    Disputed,
    Hypothesis,
}

impl Confidence {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stated" => Some(Self::Stated),
            "verified" => Some(Self::Verified),
            "disputed" => Some(Self::Disputed),
            "hypothesis" => Some(Self::Hypothesis),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stated => "stated",
            Self::Verified => "verified",
            Self::Disputed => "disputed",
            Self::Hypothesis => "hypothesis",
        }
    }
}

/// A unit of stored knowledge (§3 `Fact`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub project: String,
    pub content: String,
    pub fact_type: FactType,
    /// Stored sorted so any payload that hashes `tags` (ledger, vote
    /// entries) gets a deterministic order for free.
    pub tags: BTreeSet<String>,
    pub confidence: Confidence,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub context: Option<serde_json::Value>,
}

impl Fact {
    /// Is `at` inside `[valid_from, valid_until)`?
    pub fn visible_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_until.is_none_or(|end| at < end)
    }

    pub fn is_deprecated(&self) -> bool {
        self.valid_until.is_some()
    }
}

/// Summary of a ledger transaction, returned by `history()` (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub tx_id: crate::ids::TxId,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub operation: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// `Result<T>` returned by every fact-store search hit (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub fact_id: FactId,
    pub score: f32,
    pub fact: Fact,
}
