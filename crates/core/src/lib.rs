//! Trust Engine — embedded, tamper-evident fact store with
//! reputation-weighted consensus.
//!
//! The core primitive is a [`Fact`]: a project-scoped unit of content
//! with a bi-temporal validity window (`valid_from`/`valid_until`) and
//! a `created_at` transaction-time stamp. Every mutation is chained
//! into an append-only, hash-linked ledger and can be checkpointed
//! into a Merkle root for tamper-evidence. Multiple agents can vote on
//! a fact; their reputation-weighted votes drive its confidence level
//! through [`consensus`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use trustengine_core::{Engine, EngineConfig, FactType, Confidence};
//!
//! let engine = Engine::open_in_memory().unwrap();
//! let fact = engine
//!     .store(
//!         "demo-project",
//!         "Rust enforces ownership at compile time",
//!         FactType::Knowledge,
//!         Default::default(),
//!         Confidence::Stated,
//!         None,
//!         None,
//!         None,
//!         None,
//!     )
//!     .unwrap();
//!
//! let current = engine.recall("demo-project", None).unwrap();
//! assert_eq!(current.len(), 1);
//! let _ = fact;
//! let _: EngineConfig = EngineConfig::default();
//! ```

pub mod canonical;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
#[cfg(feature = "fulltext")]
pub mod fulltext;
pub mod ids;
pub mod ledger;
pub mod schema;
pub mod search;
pub mod store;
pub mod types;

pub use config::{EngineConfig, StorageLocation};
pub use consensus::ConsensusThresholds;
pub use engine::{
    CancellationToken, ComplianceReport, Engine, EngineError, RequirementCheck, SearchQuery,
};
pub use ids::{AgentId, CheckpointId, FactId, TxId};
pub use types::{Confidence, Fact, FactType, SearchHit, TransactionSummary};
