//! Indexer configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Configuration for an [`Indexer`](crate::Indexer) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Root of the source tree to index.
    pub root: PathBuf,
    /// Directory holding snapshots, caches and the pass lock.
    pub index_dir: PathBuf,
    /// File extensions to index (without the leading dot).
    pub extensions: Vec<String>,
    /// Whether to honor .gitignore files while scanning.
    pub respect_gitignore: bool,
    /// Hard cap on chunks taken from a single file.
    pub max_chunks_per_file: usize,
    /// Drop generic (unclassified) chunks instead of indexing them.
    pub semantic_only: bool,
    /// Lexical weight for hybrid fusion, in `[0.0, 1.0]`.
    pub hybrid_weight: f32,
    /// Approximate token budget per embedding request.
    pub batch_token_budget: usize,
    /// Retry attempts per embedding batch before it is recorded as failed.
    pub max_retries: usize,
    /// First retry delay; doubles on each subsequent attempt.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling backoff.
    pub max_backoff: Duration,
    /// Base value for the shared adaptive throttle backoff.
    pub throttle_base: Duration,
    /// Minimum time between orphan garbage collection passes.
    pub gc_interval: Duration,
    /// Orphan-count excess that triggers early garbage collection.
    pub orphan_threshold: usize,
    /// Maximum entries held in the query embedding cache.
    pub query_cache_size: usize,
    /// Time-to-live for cached query embeddings.
    pub query_cache_ttl: Duration,
    /// Jaccard similarity at which a cached query embedding is reused.
    pub query_similarity_threshold: f64,
    /// Keep 2-character tokens when tokenizing (useful for short identifiers).
    pub lenient_tokens: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            index_dir: PathBuf::from(".quarry-index"),
            extensions: vec![
                "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp", "rb",
                "md", "toml", "yaml", "yml", "json",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            respect_gitignore: true,
            max_chunks_per_file: 100,
            semantic_only: false,
            hybrid_weight: 0.3,
            batch_token_budget: 8000,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            throttle_base: Duration::from_secs(1),
            gc_interval: Duration::from_secs(24 * 60 * 60),
            orphan_threshold: 500,
            query_cache_size: 64,
            query_cache_ttl: Duration::from_secs(300),
            query_similarity_threshold: 0.85,
            lenient_tokens: false,
        }
    }
}

impl IndexConfig {
    /// Configuration rooted at `root`, with the index directory inside it.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let index_dir = root.join(".quarry-index");
        Self {
            root,
            index_dir,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if !(0.0..=1.0).contains(&self.hybrid_weight) {
            return Err(IndexError::Configuration(format!(
                "hybrid_weight must be within [0.0, 1.0], got {}",
                self.hybrid_weight
            )));
        }
        if self.max_chunks_per_file == 0 {
            return Err(IndexError::Configuration(
                "max_chunks_per_file must be nonzero".to_string(),
            ));
        }
        if self.batch_token_budget == 0 {
            return Err(IndexError::Configuration(
                "batch_token_budget must be nonzero".to_string(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(IndexError::Configuration(
                "at least one file extension is required".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.query_similarity_threshold) {
            return Err(IndexError::Configuration(format!(
                "query_similarity_threshold must be within [0.0, 1.0], got {}",
                self.query_similarity_threshold
            )));
        }
        Ok(())
    }
}
