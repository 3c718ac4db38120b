//! The indexer: orchestrates scan, diff, embedding, storage and search.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::catalog::{self, GcReport, HealthReport};
use crate::config::IndexConfig;
use crate::diff::{split_files, DiffEngine};
use crate::embeddings::EmbeddingProvider;
use crate::error::IndexError;
use crate::git::GitInfo;
use crate::manifest::{FileHashCache, PassLock};
use crate::parser::Parser;
use crate::pipeline::{EmbedPipeline, FailedBatchLedger, PipelineConfig, PipelineOutcome};
use crate::scan;
use crate::search::bm25::Bm25Index;
use crate::search::{self, SearchOptions, SearchResult, OVERFETCH_FACTOR};
use crate::store::{Store, StoreStats};
use crate::vector::VectorIndex;
use crate::DEFAULT_BRANCH;

const MODEL_META_KEY: &str = "embedding_model";

/// Lifecycle state of an indexer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Progress phases reported during an indexing pass.
///
/// Every phase is reported on every pass, even when it has nothing to do,
/// so progress consumers see a stable sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Scanning,
    Parsing,
    Embedding,
    Storing,
    Complete,
}

impl IndexPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexPhase::Scanning => "scanning",
            IndexPhase::Parsing => "parsing",
            IndexPhase::Embedding => "embedding",
            IndexPhase::Storing => "storing",
            IndexPhase::Complete => "complete",
        }
    }
}

/// Progress callback invoked once per phase.
pub type ProgressFn = Box<dyn Fn(IndexPhase) + Send + Sync>;

/// Counters from one indexing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub files_scanned: usize,
    pub files_parsed: usize,
    pub parse_failures: usize,
    /// Chunks newly embedded and written this pass.
    pub indexed_chunks: usize,
    /// Chunks skipped because their identity was already indexed.
    pub existing_chunks: usize,
    pub removed_chunks: usize,
    /// Chunks satisfied from the embedding pool without a provider call.
    pub reused_embeddings: usize,
    pub provider_calls: usize,
    pub failed_batches: usize,
    pub duration_ms: u64,
}

/// Point-in-time view of the index, available in any lifecycle state.
#[derive(Debug, Clone)]
pub struct IndexerStatus {
    pub state: IndexerState,
    pub branch: String,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub vector_count: usize,
    pub bm25_docs: usize,
    pub failed_batches: usize,
    /// Chunks this branch has that the default branch lacks.
    pub ahead_of_default: usize,
    /// Chunks the default branch has that this branch lacks.
    pub behind_default: usize,
}

/// Storage-level counters.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub store: StoreStats,
    pub vector_count: usize,
    pub bm25_docs: usize,
    pub failed_batches: usize,
}

/// Incremental, branch-scoped hybrid index over one source tree.
pub struct Indexer {
    config: IndexConfig,
    parser: Arc<dyn Parser>,
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorIndex>,
    store: Arc<dyn Store>,
    git: Arc<dyn GitInfo>,
    bm25: Arc<RwLock<Bm25Index>>,
    query_cache: Mutex<QueryCache>,
    ledger: Arc<Mutex<FailedBatchLedger>>,
    pipeline: EmbedPipeline,
    hash_cache: RwLock<FileHashCache>,
    state: RwLock<IndexerState>,
    /// Serializes indexing passes. An `index()` call issued while another is
    /// running waits for it rather than interleaving.
    pass_gate: Mutex<()>,
}

impl Indexer {
    pub fn new(
        config: IndexConfig,
        parser: Arc<dyn Parser>,
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndex>,
        store: Arc<dyn Store>,
        git: Arc<dyn GitInfo>,
    ) -> Result<Self> {
        config.validate()?;

        let bm25 = Arc::new(RwLock::new(Bm25Index::new(config.lenient_tokens)));
        let ledger = Arc::new(Mutex::new(FailedBatchLedger::load(&config.index_dir)));
        let pipeline = EmbedPipeline::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&bm25),
            Arc::clone(&ledger),
            PipelineConfig::from(&config),
        );
        let query_cache = Mutex::new(QueryCache::new(
            config.query_cache_size,
            config.query_cache_ttl,
            config.query_similarity_threshold,
        ));

        Ok(Self {
            config,
            parser,
            provider,
            vectors,
            store,
            git,
            bm25,
            query_cache,
            ledger,
            pipeline,
            hash_cache: RwLock::new(FileHashCache::default()),
            state: RwLock::new(IndexerState::Uninitialized),
            pass_gate: Mutex::new(()),
        })
    }

    /// Indexer backed by the bundled local adapters: JSON-persisted store
    /// and vector index under the index directory, branch context from
    /// `.git/HEAD` when the root is a repository.
    pub fn local(
        config: IndexConfig,
        parser: Arc<dyn Parser>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::persistent(
            config.index_dir.join("store.json"),
        ));
        let vectors: Arc<dyn VectorIndex> = Arc::new(crate::vector::MemoryVectorIndex::persistent(
            config.index_dir.join("vectors.json"),
        ));
        let git: Arc<dyn GitInfo> = match crate::git::HeadFileGit::discover(&config.root) {
            Some(git) => Arc::new(git),
            None => Arc::new(crate::git::NoGit),
        };
        Self::new(config, parser, provider, vectors, store, git)
    }

    /// Load persisted state and prepare for indexing and search.
    ///
    /// A stale pass lock means the previous process died mid-pass. Recovery
    /// is to distrust the file hash cache, which forces the next pass to
    /// re-diff everything against the store. Chunk identities make that
    /// re-diff cheap and idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == IndexerState::Ready {
            return Ok(());
        }
        *state = IndexerState::Initializing;

        if self.provider.model_name().is_empty() {
            *state = IndexerState::Uninitialized;
            return Err(IndexError::ProviderUnavailable(
                "provider has no model name".to_string(),
            )
            .into());
        }
        if self.provider.dimensions() == 0 {
            *state = IndexerState::Uninitialized;
            return Err(IndexError::ProviderUnavailable(
                "provider reports zero dimensions".to_string(),
            )
            .into());
        }

        std::fs::create_dir_all(&self.config.index_dir)
            .with_context(|| format!("failed to create {:?}", self.config.index_dir))?;

        if PassLock::is_stale(&self.config.index_dir) {
            warn!(
                "{}",
                IndexError::StaleLockDetected {
                    path: PassLock::path_in(&self.config.index_dir),
                }
            );
            let mut cache = self.hash_cache.write().await;
            cache.clear();
            cache.save(&self.config.index_dir)?;
            PassLock::clear_stale(&self.config.index_dir)?;
        } else {
            *self.hash_cache.write().await = FileHashCache::load(&self.config.index_dir);
        }

        self.store.load().await?;
        self.vectors.load().await?;
        *self.bm25.write().await =
            Bm25Index::load_or_default(&self.config.index_dir, self.config.lenient_tokens);

        let model = self.provider.model_name();
        match self.store.meta_get(MODEL_META_KEY).await? {
            Some(previous) if previous != model => {
                // The pool is keyed by model, so old embeddings simply stop
                // matching; new content re-embeds under the new model.
                warn!(%previous, current = model, "embedding model changed");
                self.store.meta_set(MODEL_META_KEY, model).await?;
            }
            Some(_) => {}
            None => self.store.meta_set(MODEL_META_KEY, model).await?,
        }

        *state = IndexerState::Ready;
        info!(
            root = %self.config.root.display(),
            branch = %self.current_branch(),
            "indexer initialized"
        );
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<()> {
        if *self.state.read().await != IndexerState::Ready {
            self.initialize().await?;
        }
        Ok(())
    }

    /// The branch the index is currently scoped to.
    pub fn current_branch(&self) -> String {
        self.git
            .branch()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    fn base_branch(&self) -> String {
        self.git
            .default_branch()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    /// Run one indexing pass for the current branch.
    ///
    /// Passes are serialized; a call made while another pass runs waits its
    /// turn and then sees that pass's results, so it typically finds very
    /// little to do.
    pub async fn index(&self, progress: Option<ProgressFn>) -> Result<IndexStats> {
        let _gate = self.pass_gate.lock().await;
        self.ensure_ready().await?;

        let report = |phase: IndexPhase| {
            if let Some(f) = &progress {
                f(phase);
            }
        };

        let start = Instant::now();
        let branch = self.current_branch();
        let lock = PassLock::acquire(&self.config.index_dir)?;

        report(IndexPhase::Scanning);
        let scanned = scan::collect_sources(
            &self.config.root,
            &self.config.extensions,
            self.config.respect_gitignore,
        )?;
        let files_scanned = scanned.len();

        let prev_live = self.store.branch_chunks(&branch).await?;

        // First pass on a branch: the hash cache belongs to whichever branch
        // wrote it last, so the fast path cannot be trusted. Re-parse all.
        let split = if prev_live.is_empty() {
            split_files(&FileHashCache::default(), scanned)
        } else {
            let cache = self.hash_cache.read().await;
            split_files(&cache, scanned)
        };

        report(IndexPhase::Parsing);
        let parsed = self.parser.parse_files(&split.to_parse).await?;
        let files_parsed = parsed.len();

        let engine = DiffEngine::new(
            self.config.max_chunks_per_file,
            self.config.semantic_only,
        );
        let outcome = engine
            .classify(&parsed, &split.unchanged, &prev_live, &self.store)
            .await?;

        report(IndexPhase::Embedding);
        let pending_chunks: Vec<_> = outcome.pending.iter().map(|p| p.chunk.clone()).collect();
        let pipeline_outcome = self.pipeline.run(outcome.pending).await?;

        report(IndexPhase::Storing);
        // Failed-batch chunks are stored too; their embeddings arrive when
        // the ledger is replayed.
        self.store.upsert_chunks(pending_chunks).await?;

        for id in &outcome.removed {
            self.vectors.remove(id).await?;
            self.bm25.write().await.remove_chunk(id);
        }
        self.store.set_branch_chunks(&branch, &outcome.live_ids).await?;

        // Parsed hashes are authoritative over scan-time hashes; a file can
        // change between the scan read and the parse.
        let mut current_hashes: HashMap<String, String> = split.current_hashes;
        for file in &parsed {
            current_hashes.insert(file.path.clone(), file.hash.clone());
        }
        {
            let mut cache = self.hash_cache.write().await;
            cache.replace(current_hashes);
            cache.save(&self.config.index_dir)?;
        }

        self.persist_all().await?;

        if catalog::gc_due(
            &self.store,
            &branch,
            self.config.gc_interval,
            self.config.orphan_threshold,
            !outcome.removed.is_empty(),
        )
        .await?
        {
            catalog::run_gc(&self.store, &self.vectors, &self.bm25).await?;
            self.persist_all().await?;
        }

        lock.release()?;
        report(IndexPhase::Complete);

        let stats = IndexStats {
            files_scanned,
            files_parsed,
            parse_failures: outcome.parse_failures.len(),
            indexed_chunks: pipeline_outcome.embedded_chunks,
            existing_chunks: outcome.existing,
            removed_chunks: outcome.removed.len(),
            reused_embeddings: pipeline_outcome.reused_embeddings,
            provider_calls: pipeline_outcome.provider_calls,
            failed_batches: pipeline_outcome.failed_batches,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            %branch,
            indexed = stats.indexed_chunks,
            existing = stats.existing_chunks,
            removed = stats.removed_chunks,
            reused = stats.reused_embeddings,
            duration_ms = stats.duration_ms,
            "indexing pass complete"
        );
        Ok(stats)
    }

    async fn persist_all(&self) -> Result<()> {
        self.store.save().await?;
        self.vectors.save().await?;
        self.bm25.read().await.save(&self.config.index_dir)?;
        Ok(())
    }

    /// Hybrid search over the current branch.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.ensure_ready().await?;

        let weight = options.hybrid_weight.clamp(0.0, 1.0);
        let fetch = options.limit.max(1) * OVERFETCH_FACTOR;
        let branch = self.current_branch();

        let semantic: Vec<(String, f32)> = if weight < 1.0 {
            let query_vector = self.query_vector(query).await?;
            self.vectors
                .search(&query_vector, fetch)
                .await?
                .into_iter()
                .map(|hit| (hit.id, hit.score))
                .collect()
        } else {
            vec![]
        };

        let lexical: Vec<(String, f32)> = if weight > 0.0 {
            self.bm25.read().await.search(query, fetch)
        } else {
            vec![]
        };

        let semantic_scores: HashMap<&String, f32> =
            semantic.iter().map(|(id, s)| (id, *s)).collect();
        let lexical_scores: HashMap<&String, f32> =
            lexical.iter().map(|(id, s)| (id, *s)).collect();

        let mut fused = search::fuse(&semantic, &lexical, weight);

        // Branch scoping. The default branch owns everything, so it skips
        // the catalog filter.
        if branch != DEFAULT_BRANCH {
            let catalog = self.store.branch_chunks(&branch).await?;
            fused.retain(|(id, _)| catalog.contains(id));
        }

        let ids: Vec<String> = fused.iter().map(|(id, _)| id.clone()).collect();
        let metadata = self.vectors.metadata_batch(&ids).await;

        let mut results = Vec::new();
        for (id, score) in fused {
            if results.len() >= options.limit {
                break;
            }
            if score < options.min_score {
                continue;
            }
            let Some(meta) = metadata.get(&id) else {
                debug!(%id, "fused hit without metadata, skipping");
                continue;
            };
            if !options.filter.matches(meta) {
                continue;
            }
            let content = if options.refresh_from_disk {
                search::refresh_content(&self.config.root, meta)
            } else {
                meta.content.clone()
            };
            results.push(SearchResult {
                vector_score: semantic_scores.get(&id).copied(),
                bm25_score: lexical_scores.get(&id).copied(),
                id,
                file_path: meta.file_path.clone(),
                start_line: meta.start_line,
                end_line: meta.end_line,
                content,
                kind: meta.kind,
                name: meta.name.clone(),
                language: meta.language.clone(),
                score,
            });
        }
        Ok(results)
    }

    async fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.query_cache.lock().await;
            if let Some(vector) = cache.get(query) {
                return Ok(vector);
            }
        }
        let embedding = self
            .provider
            .embed(query)
            .await
            .map_err(|e| anyhow!("failed to embed query: {e}"))?;
        self.query_cache
            .lock()
            .await
            .insert(query, embedding.vector.clone());
        Ok(embedding.vector)
    }

    /// Repair index entries for files deleted outside an indexing pass.
    pub async fn health_check(&self) -> Result<HealthReport> {
        self.ensure_ready().await?;
        let report =
            catalog::health_check(&self.config.root, &self.store, &self.vectors, &self.bm25)
                .await?;
        if !report.missing_files.is_empty() {
            self.persist_all().await?;
        }
        Ok(report)
    }

    /// Force an orphan collection now, regardless of schedule.
    pub async fn run_gc(&self) -> Result<GcReport> {
        self.ensure_ready().await?;
        let report = catalog::run_gc(&self.store, &self.vectors, &self.bm25).await?;
        self.persist_all().await?;
        Ok(report)
    }

    /// Replay every batch in the failed-batch ledger.
    pub async fn retry_failed_batches(&self) -> Result<PipelineOutcome> {
        self.ensure_ready().await?;
        let outcome = self.pipeline.retry_failed().await?;
        self.persist_all().await?;
        Ok(outcome)
    }

    /// Drop all indexed state, durable and in-memory.
    pub async fn clear_index(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.store.clear().await?;
        self.vectors.clear().await?;
        self.bm25.write().await.clear();
        {
            let mut cache = self.hash_cache.write().await;
            cache.clear();
            cache.save(&self.config.index_dir)?;
        }
        self.ledger.lock().await.clear()?;
        self.query_cache.lock().await.clear();
        self.persist_all().await?;
        info!("index cleared");
        Ok(())
    }

    /// Current status. Works in any lifecycle state.
    pub async fn status(&self) -> Result<IndexerStatus> {
        let state = *self.state.read().await;
        let branch = self.current_branch();
        let base = self.base_branch();

        let stats = self.store.stats(&branch).await?;
        let (ahead, behind) = if branch == base {
            (0, 0)
        } else {
            self.store.branch_delta(&branch, &base).await?
        };

        Ok(IndexerStatus {
            state,
            branch,
            chunk_count: stats.branch_chunk_count,
            embedding_count: stats.embedding_count,
            vector_count: self.vectors.count().await,
            bm25_docs: self.bm25.read().await.doc_count(),
            failed_batches: self.ledger.lock().await.len(),
            ahead_of_default: ahead,
            behind_default: behind,
        })
    }

    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let branch = self.current_branch();
        Ok(DatabaseStats {
            store: self.store.stats(&branch).await?,
            vector_count: self.vectors.count().await,
            bm25_docs: self.bm25.read().await.doc_count(),
            failed_batches: self.ledger.lock().await.len(),
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }
}
