//! End-to-end tests over a real temp directory, with a deterministic
//! in-process embedding provider.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::{tempdir, TempDir};

use quarry_index::{
    content_hash, BatchEmbedding, ChunkKind, EmbedError, Embedding, EmbeddingProvider, FailedBatch,
    GitInfo, IndexConfig, IndexPhase, Indexer, MemoryStore, MemoryVectorIndex, ParsedFile, Parser,
    RawChunk, SearchOptions, SourceFile, Store, VectorIndex, DEFAULT_BRANCH,
};

/// Splits files on blank lines; every block becomes a function chunk.
struct BlockParser;

#[async_trait]
impl Parser for BlockParser {
    async fn parse_files(&self, files: &[SourceFile]) -> anyhow::Result<Vec<ParsedFile>> {
        let mut parsed = Vec::new();
        for file in files {
            let mut chunks = Vec::new();
            let mut block: Vec<&str> = Vec::new();
            let mut block_start = 1usize;
            let lines: Vec<&str> = file.content.lines().collect();
            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    if !block.is_empty() {
                        chunks.push(RawChunk {
                            content: block.join("\n"),
                            start_line: block_start,
                            end_line: i,
                            kind: ChunkKind::Function,
                            name: None,
                            language: "rust".to_string(),
                        });
                        block.clear();
                    }
                    block_start = i + 2;
                } else {
                    block.push(line);
                }
            }
            if !block.is_empty() {
                chunks.push(RawChunk {
                    content: block.join("\n"),
                    start_line: block_start,
                    end_line: lines.len(),
                    kind: ChunkKind::Function,
                    name: None,
                    language: "rust".to_string(),
                });
            }
            parsed.push(ParsedFile {
                path: file.path.clone(),
                hash: content_hash(&file.content),
                chunks,
            });
        }
        Ok(parsed)
    }
}

const DIMS: usize = 8;

/// Deterministic provider: vectors derived from a hash of the text, plus a
/// scriptable failure queue consumed one entry per request.
struct TestProvider {
    calls: AtomicUsize,
    failures: std::sync::Mutex<VecDeque<EmbedError>>,
}

impl TestProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures: std::sync::Mutex::new(VecDeque::new()),
        }
    }

    fn script_failures(&self, failures: Vec<EmbedError>) {
        self.failures.lock().unwrap().extend(failures);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        digest[..DIMS]
            .iter()
            .map(|b| *b as f32 / 255.0)
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for TestProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        Ok(Embedding {
            vector: batch.vectors.into_iter().next().unwrap(),
            tokens_used: batch.total_tokens_used,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        Ok(BatchEmbedding {
            vectors: texts.iter().map(|t| Self::vector_for(t)).collect(),
            total_tokens_used: texts.len() * 4,
        })
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn model_name(&self) -> &str {
        "test-model"
    }
}

/// Git context whose branch can be switched mid-test.
struct FakeGit {
    branch: std::sync::Mutex<String>,
}

impl FakeGit {
    fn on(branch: &str) -> Self {
        Self {
            branch: std::sync::Mutex::new(branch.to_string()),
        }
    }

    fn switch(&self, branch: &str) {
        *self.branch.lock().unwrap() = branch.to_string();
    }
}

impl GitInfo for FakeGit {
    fn branch(&self) -> Option<String> {
        Some(self.branch.lock().unwrap().clone())
    }

    fn default_branch(&self) -> Option<String> {
        Some("main".to_string())
    }
}

struct Harness {
    dir: TempDir,
    indexer: Indexer,
    provider: Arc<TestProvider>,
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorIndex>,
}

fn build(dir: &TempDir, git: Arc<dyn GitInfo>) -> (Indexer, Arc<TestProvider>, Arc<dyn Store>, Arc<dyn VectorIndex>) {
    let config = fast_config(dir.path());
    let provider = Arc::new(TestProvider::new());
    let store: Arc<dyn Store> =
        Arc::new(MemoryStore::persistent(config.index_dir.join("store.json")));
    let vectors: Arc<dyn VectorIndex> = Arc::new(MemoryVectorIndex::persistent(
        config.index_dir.join("vectors.json"),
    ));
    let indexer = Indexer::new(
        config,
        Arc::new(BlockParser),
        provider.clone(),
        Arc::clone(&vectors),
        Arc::clone(&store),
        git,
    )
    .unwrap();
    (indexer, provider, store, vectors)
}

fn fast_config(root: &Path) -> IndexConfig {
    IndexConfig {
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
        throttle_base: Duration::from_millis(5),
        respect_gitignore: false,
        extensions: vec!["rs".to_string()],
        ..IndexConfig::for_root(root)
    }
}

async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let (indexer, provider, store, vectors) = build(&dir, Arc::new(quarry_index::NoGit));
    indexer.initialize().await.unwrap();
    Harness {
        dir,
        indexer,
        provider,
        store,
        vectors,
    }
}

fn write(dir: &TempDir, name: &str, content: &str) {
    fs::write(dir.path().join(name), content).unwrap();
}

#[tokio::test]
async fn test_full_pass_then_idempotent_repeat() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn alpha() {\n    parse_input();\n}\n\nfn beta() {}\n");
    write(&h.dir, "b.rs", "fn gamma() {\n    open_socket();\n}\n");

    let first = h.indexer.index(None).await.unwrap();
    assert_eq!(first.files_scanned, 2);
    assert_eq!(first.files_parsed, 2);
    assert_eq!(first.indexed_chunks, 3);
    assert_eq!(first.removed_chunks, 0);
    assert!(first.provider_calls > 0);

    let calls_after_first = h.provider.calls();
    let second = h.indexer.index(None).await.unwrap();
    assert_eq!(second.files_parsed, 0);
    assert_eq!(second.indexed_chunks, 0);
    assert_eq!(second.removed_chunks, 0);
    assert_eq!(second.existing_chunks, 3);
    assert_eq!(second.provider_calls, 0);
    assert_eq!(h.provider.calls(), calls_after_first);
}

#[tokio::test]
async fn test_phases_reported_in_order_every_pass() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn only() {}\n");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.indexer
        .index(Some(Box::new(move |phase| sink.lock().unwrap().push(phase))))
        .await
        .unwrap();

    let expected = vec![
        IndexPhase::Scanning,
        IndexPhase::Parsing,
        IndexPhase::Embedding,
        IndexPhase::Storing,
        IndexPhase::Complete,
    ];
    assert_eq!(*seen.lock().unwrap(), expected);

    // A no-op pass still reports every phase.
    let seen2 = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink2 = Arc::clone(&seen2);
    h.indexer
        .index(Some(Box::new(move |phase| sink2.lock().unwrap().push(phase))))
        .await
        .unwrap();
    assert_eq!(*seen2.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_duplicate_content_reuses_embedding() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn shared_helper() {\n    common();\n}\n");
    h.indexer.index(None).await.unwrap();

    let calls_before = h.provider.calls();
    // Identical content in a new file: new chunk identity, pooled embedding.
    write(&h.dir, "b.rs", "fn shared_helper() {\n    common();\n}\n");
    let stats = h.indexer.index(None).await.unwrap();

    assert_eq!(stats.reused_embeddings, 1);
    assert_eq!(stats.indexed_chunks, 1);
    assert_eq!(stats.provider_calls, 0);
    assert_eq!(h.provider.calls(), calls_before);
}

#[tokio::test]
async fn test_edit_reindexes_only_changed_chunk() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn first() {}\n\nfn second() {}\n");
    write(&h.dir, "b.rs", "fn untouched() {}\n");
    h.indexer.index(None).await.unwrap();

    // Only the second block changes; spans of the first are preserved.
    write(&h.dir, "a.rs", "fn first() {}\n\nfn second_renamed() {}\n");
    let stats = h.indexer.index(None).await.unwrap();

    assert_eq!(stats.files_parsed, 1);
    assert_eq!(stats.indexed_chunks, 1);
    assert_eq!(stats.removed_chunks, 1);
    assert_eq!(stats.existing_chunks, 2);
}

#[tokio::test]
async fn test_deleted_file_chunks_removed_from_search() {
    let h = harness().await;
    write(&h.dir, "keep.rs", "fn keep_me() {\n    keeper_logic();\n}\n");
    write(&h.dir, "gone.rs", "fn remove_me() {\n    vanishing_logic();\n}\n");
    h.indexer.index(None).await.unwrap();

    fs::remove_file(h.dir.path().join("gone.rs")).unwrap();
    let stats = h.indexer.index(None).await.unwrap();
    assert_eq!(stats.removed_chunks, 1);

    let results = h
        .indexer
        .search("vanishing_logic", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.file_path != "gone.rs"));

    let results = h
        .indexer
        .search("keeper_logic", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.file_path == "keep.rs"));
}

#[tokio::test]
async fn test_deleted_then_restored_file_is_searchable() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn phoenix() {\n    rises_again();\n}\n");
    h.indexer.index(None).await.unwrap();

    fs::remove_file(h.dir.path().join("a.rs")).unwrap();
    let removed = h.indexer.index(None).await.unwrap();
    assert_eq!(removed.removed_chunks, 1);

    // Restore the identical file before orphan GC reaps the store row. The
    // chunk row and pooled embedding are still around, but the search
    // entries were dropped with the removal and must come back.
    write(&h.dir, "a.rs", "fn phoenix() {\n    rises_again();\n}\n");
    let restored = h.indexer.index(None).await.unwrap();
    assert_eq!(restored.indexed_chunks, 1);
    assert_eq!(restored.reused_embeddings, 1);
    assert_eq!(restored.provider_calls, 0);

    let results = h
        .indexer
        .search("rises_again", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.file_path == "a.rs"));

    let db = h.indexer.database_stats().await.unwrap();
    assert_eq!(db.bm25_docs, 1);
    assert_eq!(db.vector_count, 1);
}

#[tokio::test]
async fn test_hybrid_weight_boundaries() {
    let h = harness().await;
    write(
        &h.dir,
        "a.rs",
        "fn tokenize_identifiers() {\n    lexical_only_marker();\n}\n\nfn cosine_distance() {\n    vector_math();\n}\n",
    );
    h.indexer.index(None).await.unwrap();

    // Purely lexical: every hit must carry a lexical score and no fused hit
    // may come from the semantic source alone.
    let lexical = h
        .indexer
        .search(
            "lexical_only_marker",
            &SearchOptions {
                hybrid_weight: 1.0,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!lexical.is_empty());
    assert!(lexical.iter().all(|r| r.bm25_score.is_some()));
    // At weight 1.0 the query is never embedded.
    let calls = h.provider.calls();
    h.indexer
        .search(
            "another_lexical_query",
            &SearchOptions {
                hybrid_weight: 1.0,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.provider.calls(), calls);

    // Purely semantic: ranked solely by vector similarity.
    let semantic = h
        .indexer
        .search(
            "vector math helpers",
            &SearchOptions {
                hybrid_weight: 0.0,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(!semantic.is_empty());
    assert!(semantic.iter().all(|r| r.vector_score.is_some()));
    for pair in semantic.windows(2) {
        assert!(pair[0].vector_score.unwrap() >= pair[1].vector_score.unwrap());
    }
}

#[tokio::test]
async fn test_query_cache_avoids_repeat_embedding() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn cached_query_target() {}\n");
    h.indexer.index(None).await.unwrap();

    let options = SearchOptions::default();
    h.indexer.search("cached query target", &options).await.unwrap();
    let calls = h.provider.calls();
    h.indexer.search("cached query target", &options).await.unwrap();
    assert_eq!(h.provider.calls(), calls);
}

#[tokio::test]
async fn test_rate_limit_retry_recovers() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn resilient() {\n    retry_logic();\n}\n");

    h.provider.script_failures(vec![
        EmbedError::rate_limited("429 slow down"),
        EmbedError::rate_limited("429 slow down"),
    ]);

    let stats = h.indexer.index(None).await.unwrap();
    assert_eq!(stats.indexed_chunks, 1);
    assert_eq!(stats.failed_batches, 0);
    assert_eq!(stats.provider_calls, 3);
}

#[tokio::test]
async fn test_exhausted_retries_land_in_ledger_and_replay() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn eventually_indexed() {}\n");

    // More transient failures than max_retries allows.
    h.provider.script_failures(vec![
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
    ]);

    let stats = h.indexer.index(None).await.unwrap();
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.indexed_chunks, 0);

    let status = h.indexer.status().await.unwrap();
    assert_eq!(status.failed_batches, 1);

    // Replay succeeds once the provider behaves.
    let outcome = h.indexer.retry_failed_batches().await.unwrap();
    assert_eq!(outcome.embedded_chunks, 1);
    assert_eq!(outcome.failed_batches, 0);

    let status = h.indexer.status().await.unwrap();
    assert_eq!(status.failed_batches, 0);

    let results = h
        .indexer
        .search("eventually_indexed", &SearchOptions::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_replayed_batch_keeps_cumulative_attempts() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn stubborn_failure() {}\n");

    h.provider.script_failures(vec![
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
    ]);
    h.indexer.index(None).await.unwrap();

    let ledger_path = h.indexer.config().index_dir.join("failed_batches.json");
    let entries: Vec<FailedBatch> =
        serde_json::from_str(&fs::read_to_string(&ledger_path).unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 4);

    // A replay that fails again adds to the recorded total instead of
    // starting over.
    h.provider.script_failures(vec![
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
        EmbedError::transient("boom"),
    ]);
    let outcome = h.indexer.retry_failed_batches().await.unwrap();
    assert_eq!(outcome.failed_batches, 1);

    let entries: Vec<FailedBatch> =
        serde_json::from_str(&fs::read_to_string(&ledger_path).unwrap()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 8);
}

#[tokio::test]
async fn test_non_retryable_error_fails_fast() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn rejected() {}\n");

    h.provider
        .script_failures(vec![EmbedError::non_retryable("401 bad key")]);

    let stats = h.indexer.index(None).await.unwrap();
    assert_eq!(stats.failed_batches, 1);
    // One call, no retries.
    assert_eq!(stats.provider_calls, 1);
}

#[tokio::test]
async fn test_crash_recovery_reparses_everything() {
    let dir = tempdir().unwrap();
    {
        let (indexer, _, _, _) = build(&dir, Arc::new(quarry_index::NoGit));
        indexer.initialize().await.unwrap();
        write(&dir, "a.rs", "fn survivor() {\n    durable();\n}\n");
        indexer.index(None).await.unwrap();
    }

    // Simulate a crash mid-pass: the lock marker is left behind.
    let index_dir = dir.path().join(".quarry-index");
    fs::write(index_dir.join("index.lock"), "12345").unwrap();

    let (indexer, provider, _, _) = build(&dir, Arc::new(quarry_index::NoGit));
    indexer.initialize().await.unwrap();
    assert!(!index_dir.join("index.lock").exists());

    // The fast path is distrusted, so the file is re-parsed, but chunk
    // identities match and nothing is re-embedded.
    let stats = indexer.index(None).await.unwrap();
    assert_eq!(stats.files_parsed, 1);
    assert_eq!(stats.indexed_chunks, 0);
    assert_eq!(stats.existing_chunks, 1);
    assert_eq!(provider.calls(), 0);

    let results = indexer
        .search("durable", &SearchOptions::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let (indexer, _, _, _) = build(&dir, Arc::new(quarry_index::NoGit));
        indexer.initialize().await.unwrap();
        write(&dir, "a.rs", "fn persisted_symbol() {\n    restart_proof();\n}\n");
        indexer.index(None).await.unwrap();
    }

    let (indexer, provider, _, _) = build(&dir, Arc::new(quarry_index::NoGit));
    indexer.initialize().await.unwrap();

    let stats = indexer.index(None).await.unwrap();
    assert_eq!(stats.indexed_chunks, 0);
    assert_eq!(stats.files_parsed, 0);
    assert_eq!(provider.calls(), 0);

    let results = indexer
        .search("restart_proof", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].file_path, "a.rs");
}

#[tokio::test]
async fn test_branch_scoping_and_delta() {
    let dir = tempdir().unwrap();
    let git = Arc::new(FakeGit::on("main"));
    let (indexer, _, _, _) = build(&dir, git.clone());
    indexer.initialize().await.unwrap();

    write(&dir, "shared.rs", "fn shared_code() {\n    everywhere();\n}\n");
    indexer.index(None).await.unwrap();

    // Feature branch adds a file on top of main.
    git.switch("feature");
    write(&dir, "feature.rs", "fn feature_only() {\n    new_work();\n}\n");
    indexer.index(None).await.unwrap();

    let status = indexer.status().await.unwrap();
    assert_eq!(status.branch, "feature");
    assert_eq!(status.ahead_of_default, 1);
    assert_eq!(status.behind_default, 0);

    let results = indexer
        .search("feature_only", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().any(|r| r.file_path == "feature.rs"));

    // Back on main, the feature chunk is out of scope.
    git.switch("main");
    fs::remove_file(dir.path().join("feature.rs")).unwrap();
    let results = indexer
        .search("feature_only new_work", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.file_path != "feature.rs"));
}

#[tokio::test]
async fn test_gc_collects_orphans_and_is_idempotent() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn doomed() {\n    short_lived();\n}\n");
    h.indexer.index(None).await.unwrap();

    fs::remove_file(h.dir.path().join("a.rs")).unwrap();
    h.indexer.index(None).await.unwrap();

    let report = h.indexer.run_gc().await.unwrap();
    // The pass already removed the vector; GC reaps the orphaned store rows
    // and pooled embedding.
    assert_eq!(report.orphan_chunks, 1);
    assert_eq!(report.orphan_embeddings, 1);

    let second = h.indexer.run_gc().await.unwrap();
    assert_eq!(second.orphan_chunks, 0);
    assert_eq!(second.orphan_embeddings, 0);

    assert_eq!(h.vectors.count().await, 0);
    let stats = h.store.stats(DEFAULT_BRANCH).await.unwrap();
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.embedding_count, 0);
}

#[tokio::test]
async fn test_health_check_repairs_out_of_band_deletion() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn checked() {\n    healthy();\n}\n");
    h.indexer.index(None).await.unwrap();

    // Delete the file without running a pass.
    fs::remove_file(h.dir.path().join("a.rs")).unwrap();
    let report = h.indexer.health_check().await.unwrap();
    assert_eq!(report.missing_files, vec!["a.rs"]);
    assert_eq!(report.removed_chunks, 1);

    let results = h
        .indexer
        .search("healthy", &SearchOptions::default())
        .await
        .unwrap();
    assert!(results.is_empty());

    let clean = h.indexer.health_check().await.unwrap();
    assert!(clean.missing_files.is_empty());
}

#[tokio::test]
async fn test_clear_index_drops_everything() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn temporary() {\n    wipe_me();\n}\n");
    h.indexer.index(None).await.unwrap();

    h.indexer.clear_index().await.unwrap();

    let db = h.indexer.database_stats().await.unwrap();
    assert_eq!(db.store.chunk_count, 0);
    assert_eq!(db.vector_count, 0);
    assert_eq!(db.bm25_docs, 0);
    assert_eq!(db.failed_batches, 0);

    // A fresh pass rebuilds from scratch.
    let stats = h.indexer.index(None).await.unwrap();
    assert_eq!(stats.indexed_chunks, 1);
}

#[tokio::test]
async fn test_search_filters_and_min_score() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn filter_target() {\n    findable_code();\n}\n");
    h.indexer.index(None).await.unwrap();

    let options = SearchOptions {
        filter: quarry_index::SearchFilter::new().with_path_prefix("nomatch/"),
        ..SearchOptions::default()
    };
    let results = h.indexer.search("findable_code", &options).await.unwrap();
    assert!(results.is_empty());

    let options = SearchOptions {
        min_score: 2.0,
        ..SearchOptions::default()
    };
    let results = h.indexer.search("findable_code", &options).await.unwrap();
    assert!(results.is_empty());

    let options = SearchOptions {
        filter: quarry_index::SearchFilter::new()
            .with_extensions(vec!["rs".to_string()])
            .with_kinds(vec![ChunkKind::Function]),
        ..SearchOptions::default()
    };
    let results = h.indexer.search("findable_code", &options).await.unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn test_refresh_from_disk_returns_current_content() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn evolving() {\n    original_body();\n}\n");
    h.indexer.index(None).await.unwrap();

    // Edit the file without reindexing.
    write(&h.dir, "a.rs", "fn evolving() {\n    edited_body();\n}\n");

    let stale = h
        .indexer
        .search("original_body", &SearchOptions::default())
        .await
        .unwrap();
    assert!(stale[0].content.contains("original_body"));

    let fresh = h
        .indexer
        .search(
            "original_body",
            &SearchOptions {
                refresh_from_disk: true,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(fresh[0].content.contains("edited_body"));
}

#[tokio::test]
async fn test_overlapping_passes_serialize() {
    let h = harness().await;
    write(&h.dir, "a.rs", "fn contended() {\n    busy_work();\n}\n");

    let indexer = Arc::new(h.indexer);
    let first = {
        let indexer = Arc::clone(&indexer);
        tokio::spawn(async move { indexer.index(None).await })
    };
    let second = {
        let indexer = Arc::clone(&indexer);
        tokio::spawn(async move { indexer.index(None).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    // Exactly one pass did the work; the other found it already done.
    let indexed: Vec<usize> = vec![a.indexed_chunks, b.indexed_chunks];
    assert!(indexed.contains(&1));
    assert_eq!(a.indexed_chunks + b.indexed_chunks, 1);
}

#[tokio::test]
async fn test_operations_initialize_implicitly() {
    let dir = tempdir().unwrap();
    let (indexer, _, _, _) = build(&dir, Arc::new(quarry_index::NoGit));

    // Status reflects the raw state before any operation runs.
    let status = indexer.status().await.unwrap();
    assert_eq!(status.state, quarry_index::IndexerState::Uninitialized);

    // index() without an explicit initialize() self-initializes.
    write(&dir, "a.rs", "fn implicit() {}\n");
    let stats = indexer.index(None).await.unwrap();
    assert_eq!(stats.indexed_chunks, 1);

    let status = indexer.status().await.unwrap();
    assert_eq!(status.state, quarry_index::IndexerState::Ready);
}

#[tokio::test]
async fn test_shared_bm25_lock_is_consistent_after_pass() {
    // The pipeline and the pass both write the lexical index; after a pass
    // its document count must match the vector count.
    let h = harness().await;
    write(&h.dir, "a.rs", "fn one() {}\n\nfn two() {}\n\nfn three() {}\n");
    h.indexer.index(None).await.unwrap();

    let db = h.indexer.database_stats().await.unwrap();
    assert_eq!(db.bm25_docs, 3);
    assert_eq!(db.vector_count, 3);
    assert_eq!(db.store.chunk_count, 3);
}
