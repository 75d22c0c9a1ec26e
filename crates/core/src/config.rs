//! Engine-wide configuration (§6).
//!
//! A plain struct with a `Default` impl, the way the teacher configures
//! `TemporalGraph` through constructor arguments rather than a config
//! file or environment-variable loader — this crate is an embedded
//! library, not a standalone service, so there is no need for a
//! `config`-crate-style layered loader here.

use std::path::PathBuf;

use crate::consensus::ConsensusThresholds;

/// Where the engine's redb file lives, or an in-memory backend for
/// tests and ephemeral use.
#[derive(Debug, Clone)]
pub enum StorageLocation {
    Path(PathBuf),
    InMemory,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub storage: StorageLocation,
    /// Expected embedding width. `VectorIndex` still learns its actual
    /// dimension from the first `embed()` call; this is the advisory
    /// default callers are expected to use.
    pub embedding_dim: u32,
    /// Window within which two facts with the same `(project, content,
    /// fact_type)` hash are treated as duplicates. `None` disables
    /// de-duplication.
    pub dedup_window: Option<chrono::Duration>,
    /// Number of ledger transactions between automatic Merkle
    /// checkpoints. `0` disables automatic checkpointing.
    pub checkpoint_batch: u64,
    /// Half-life, in days, for the recency component of hybrid search
    /// scoring.
    pub recency_half_life_days: f64,
    /// Score cutoffs driving a fact's confidence state (§4.4).
    pub consensus_thresholds: ConsensusThresholds,
    /// Hard cap on stored `content` length, in bytes.
    pub max_content_bytes: usize,
    /// Maximum graph-expansion hops a single search may take beyond its
    /// direct embedding matches.
    pub max_expansion_depth: usize,
    /// Upper bound on concurrent writer-lock waiters before `store`,
    /// `vote`, and friends return `EngineError::Unavailable` instead of
    /// blocking indefinitely (§5).
    pub max_writer_queue_depth: usize,
    /// Exposed-but-out-of-scope: read by the HTTP/RPC layer this engine
    /// does not implement, never consulted by the core itself.
    pub cors_origins: Vec<String>,
    /// Exposed-but-out-of-scope, same as `cors_origins`.
    pub rate_limit: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageLocation::InMemory,
            embedding_dim: 384,
            dedup_window: Some(chrono::Duration::seconds(60)),
            checkpoint_batch: 1000,
            recency_half_life_days: crate::search::DEFAULT_RECENCY_HALF_LIFE_DAYS,
            consensus_thresholds: ConsensusThresholds::default(),
            max_content_bytes: 65536,
            max_expansion_depth: 2,
            max_writer_queue_depth: 64,
            cors_origins: Vec::new(),
            rate_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageLocation::Path(path.into()),
            ..Self::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_in_memory_with_dedup_enabled() {
        let config = EngineConfig::default();
        assert!(matches!(config.storage, StorageLocation::InMemory));
        assert!(config.dedup_window.is_some());
    }

    #[test]
    fn at_path_overrides_storage_only() {
        let config = EngineConfig::at_path("/tmp/trustengine.redb");
        assert!(matches!(config.storage, StorageLocation::Path(_)));
        assert_eq!(config.checkpoint_batch, EngineConfig::default().checkpoint_batch);
    }
}
