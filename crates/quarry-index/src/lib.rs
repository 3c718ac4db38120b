//! Incremental, branch-scoped hybrid search index over a source tree.
//!
//! This crate provides:
//! - Incremental diffing of files and chunks against prior index state
//! - Content-addressed embedding reuse across chunk locations
//! - A rate-limited concurrent embedding pipeline with a durable
//!   failed-batch ledger
//! - A BM25 lexical index persisted as a whole snapshot
//! - Linear fusion of semantic and lexical rankings with post-filters
//! - Per-branch chunk catalogs with orphan garbage collection
//! - A near-duplicate query embedding cache and crash recovery

pub mod cache;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod diff;
pub mod embeddings;
pub mod error;
pub mod git;
pub mod indexer;
pub mod manifest;
pub mod parser;
pub mod pipeline;
pub mod scan;
pub mod search;
pub mod snapshot;
pub mod store;
pub mod vector;

// Re-exports
pub use cache::QueryCache;
pub use catalog::{GcReport, HealthReport};
pub use chunk::{chunk_id, content_hash, estimate_tokens, Chunk, ChunkKind, PendingChunk};
pub use config::IndexConfig;
pub use diff::{DiffEngine, DiffOutcome, FileSplit};
pub use embeddings::{
    BatchEmbedding, EmbedError, EmbedErrorKind, Embedding, EmbeddingProvider, HttpEmbeddings,
    ProviderLimits,
};
pub use error::IndexError;
pub use git::{GitInfo, HeadFileGit, NoGit};
pub use indexer::{
    DatabaseStats, IndexPhase, IndexStats, Indexer, IndexerState, IndexerStatus, ProgressFn,
};
pub use manifest::{FileHashCache, PassLock};
pub use parser::{ParsedFile, Parser, RawChunk, SourceFile};
pub use pipeline::{
    EmbedPipeline, FailedBatch, FailedBatchLedger, PipelineConfig, PipelineOutcome,
};
pub use search::bm25::Bm25Index;
pub use search::{SearchFilter, SearchOptions, SearchResult};
pub use store::{MemoryStore, Store, StoreStats, StoredEmbedding};
pub use vector::{MemoryVectorIndex, VectorEntry, VectorHit, VectorIndex, VectorMetadata};

/// Branch name used when no git context is available (unscoped).
pub const DEFAULT_BRANCH: &str = "default";
