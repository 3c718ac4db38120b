//! Concurrent embedding pipeline.
//!
//! Pending chunks are deduplicated by content hash, packed into batches
//! under a token budget, and embedded by a bounded set of workers. Workers
//! share one throttle so a rate-limit response from any of them slows all
//! of them. Batches that exhaust their retries land in a durable ledger and
//! can be replayed later.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::chunk::{estimate_tokens, PendingChunk};
use crate::config::IndexConfig;
use crate::embeddings::{EmbedErrorKind, EmbeddingProvider, ProviderLimits};
use crate::error::IndexError;
use crate::search::bm25::Bm25Index;
use crate::snapshot;
use crate::store::{Store, StoredEmbedding};
use crate::vector::{VectorEntry, VectorIndex, VectorMetadata};

pub const LEDGER_FILE: &str = "failed_batches.json";

/// Tuning knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_token_budget: usize,
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub throttle_base: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_token_budget: 8000,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            throttle_base: Duration::from_secs(1),
        }
    }
}

impl From<&IndexConfig> for PipelineConfig {
    fn from(config: &IndexConfig) -> Self {
        Self {
            batch_token_budget: config.batch_token_budget,
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            throttle_base: config.throttle_base,
        }
    }
}

/// A batch that exhausted its retries, recorded durably for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
    pub chunks: Vec<PendingChunk>,
    pub error: String,
    pub attempts: usize,
    /// Unix seconds of the last attempt.
    pub last_attempt: u64,
}

/// Durable JSON ledger of failed batches.
#[derive(Debug)]
pub struct FailedBatchLedger {
    path: PathBuf,
    entries: Vec<FailedBatch>,
}

impl FailedBatchLedger {
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(LEDGER_FILE);
        let entries: Vec<FailedBatch> = snapshot::load_or_default(&path);
        Self { path, entries }
    }

    pub fn append(&mut self, batch: FailedBatch) {
        self.entries.push(batch);
    }

    pub fn persist(&self) -> Result<()> {
        snapshot::write_json(&self.path, &self.entries)
    }

    /// Drain all entries for a replay attempt.
    pub fn take_all(&mut self) -> Vec<FailedBatch> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Shared adaptive throttle.
///
/// Serializes request starts with a minimum spacing, plus an adaptive
/// backoff that doubles on rate-limit responses and halves on successes.
/// All workers share one instance, so one worker's 429 slows everyone.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    base_ms: u64,
    max_backoff_ms: u64,
    backoff_ms: AtomicU64,
    next_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration, base: Duration, max_backoff: Duration) -> Self {
        Self {
            min_interval,
            base_ms: base.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
            backoff_ms: AtomicU64::new(0),
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller may start its request.
    pub async fn pace(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let backoff = Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed));
            let start = slot.unwrap_or(now).max(now) + backoff;
            *slot = Some(start + self.min_interval);
            start.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    pub fn on_rate_limit(&self) {
        let current = self.backoff_ms.load(Ordering::Relaxed);
        let next = if current == 0 {
            self.base_ms
        } else {
            (current * 2).min(self.max_backoff_ms)
        };
        self.backoff_ms.store(next, Ordering::Relaxed);
        debug!(backoff_ms = next, "raised throttle backoff");
    }

    pub fn on_success(&self) {
        let current = self.backoff_ms.load(Ordering::Relaxed);
        if current > 0 {
            self.backoff_ms.store(current / 2, Ordering::Relaxed);
        }
    }

    pub fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed))
    }
}

/// One unit of embedding work: a unique text plus every chunk that carries it.
#[derive(Debug, Clone)]
struct EmbedItem {
    content_hash: String,
    text: String,
    chunks: Vec<PendingChunk>,
}

/// Outcome counters for one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    /// Chunks written to the index this run.
    pub embedded_chunks: usize,
    /// Chunks satisfied from the embedding pool without a provider call.
    pub reused_embeddings: usize,
    /// Requests actually sent to the provider.
    pub provider_calls: usize,
    /// Batches recorded to the failed-batch ledger.
    pub failed_batches: usize,
}

/// Embeds pending chunks and writes them through to every index structure.
pub struct EmbedPipeline {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorIndex>,
    bm25: Arc<RwLock<Bm25Index>>,
    ledger: Arc<Mutex<FailedBatchLedger>>,
    throttle: Arc<Throttle>,
    semaphore: Arc<Semaphore>,
    config: PipelineConfig,
}

impl EmbedPipeline {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorIndex>,
        bm25: Arc<RwLock<Bm25Index>>,
        ledger: Arc<Mutex<FailedBatchLedger>>,
        config: PipelineConfig,
    ) -> Self {
        let limits = ProviderLimits::for_model(provider.model_name());
        let throttle = Arc::new(Throttle::new(
            limits.min_interval,
            config.throttle_base,
            config.max_backoff,
        ));
        let semaphore = Arc::new(Semaphore::new(limits.max_concurrency));
        Self {
            provider,
            store,
            vectors,
            bm25,
            ledger,
            throttle,
            semaphore,
            config,
        }
    }

    pub fn current_throttle(&self) -> Arc<Throttle> {
        Arc::clone(&self.throttle)
    }

    /// Embed `pending` chunks and write them through to the store, the
    /// vector index and the lexical index.
    pub async fn run(&self, pending: Vec<PendingChunk>) -> Result<PipelineOutcome> {
        self.run_inner(pending, 0).await
    }

    /// `prior_attempts` carries the attempt count of a replayed ledger
    /// entry, so a batch that fails again keeps its cumulative total.
    async fn run_inner(
        &self,
        pending: Vec<PendingChunk>,
        prior_attempts: usize,
    ) -> Result<PipelineOutcome> {
        let mut outcome = PipelineOutcome::default();
        if pending.is_empty() {
            return Ok(outcome);
        }

        // Deduplicate by content hash, preserving first-seen order.
        let mut items: Vec<EmbedItem> = Vec::new();
        let mut by_hash: HashMap<String, usize> = HashMap::new();
        for chunk in pending {
            let hash = chunk.chunk.content_hash.clone();
            match by_hash.get(&hash) {
                Some(&idx) => items[idx].chunks.push(chunk),
                None => {
                    by_hash.insert(hash.clone(), items.len());
                    items.push(EmbedItem {
                        content_hash: hash,
                        text: chunk.embed_text.clone(),
                        chunks: vec![chunk],
                    });
                }
            }
        }

        let model = self.provider.model_name().to_string();
        let hashes: Vec<String> = items.iter().map(|i| i.content_hash.clone()).collect();
        let missing = self.store.missing_embeddings(&model, &hashes).await?;

        let (to_embed, reusable): (Vec<EmbedItem>, Vec<EmbedItem>) = items
            .into_iter()
            .partition(|item| missing.contains(&item.content_hash));

        for item in reusable {
            let Some(stored) = self.store.embedding(&model, &item.content_hash).await? else {
                continue;
            };
            outcome.reused_embeddings += item.chunks.len();
            outcome.embedded_chunks += item.chunks.len();
            self.write_through(&item.chunks, &stored.vector).await?;
        }

        if to_embed.is_empty() {
            return Ok(outcome);
        }

        let batches = plan_batches(to_embed, self.config.batch_token_budget);
        info!(
            batches = batches.len(),
            reused = outcome.reused_embeddings,
            "embedding new content"
        );

        let mut tasks: JoinSet<(Vec<EmbedItem>, Result<BatchResult, String>, usize)> =
            JoinSet::new();
        for batch in batches {
            let provider = Arc::clone(&self.provider);
            let throttle = Arc::clone(&self.throttle);
            let semaphore = Arc::clone(&self.semaphore);
            let config = self.config.clone();
            tasks.spawn(async move {
                embed_batch_with_retry(batch, provider, throttle, semaphore, config).await
            });
        }

        let mut successes: Vec<(Vec<EmbedItem>, Vec<Vec<f32>>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (batch, result, calls) = joined?;
            outcome.provider_calls += calls;
            match result {
                Ok(result) => successes.push((batch, result.vectors)),
                Err(error) => {
                    outcome.failed_batches += 1;
                    let chunks: Vec<PendingChunk> =
                        batch.into_iter().flat_map(|i| i.chunks).collect();
                    warn!(chunks = chunks.len(), %error, "embedding batch failed, recording");
                    let mut ledger = self.ledger.lock().await;
                    ledger.append(FailedBatch {
                        chunks,
                        error,
                        attempts: prior_attempts + calls,
                        last_attempt: unix_now(),
                    });
                    ledger.persist()?;
                }
            }
        }

        for (batch, vectors) in successes {
            let mut stored = Vec::new();
            for (item, vector) in batch.iter().zip(vectors.iter()) {
                stored.push(StoredEmbedding {
                    content_hash: item.content_hash.clone(),
                    model: model.clone(),
                    vector: vector.clone(),
                    text: item.text.clone(),
                });
            }
            self.store.put_embeddings(stored).await?;
            for (item, vector) in batch.iter().zip(vectors.iter()) {
                outcome.embedded_chunks += item.chunks.len();
                self.write_through(&item.chunks, vector).await?;
            }
        }

        Ok(outcome)
    }

    /// Replay every batch in the failed-batch ledger.
    pub async fn retry_failed(&self) -> Result<PipelineOutcome> {
        let batches = {
            let mut ledger = self.ledger.lock().await;
            let batches = ledger.take_all();
            ledger.persist()?;
            batches
        };
        if batches.is_empty() {
            return Ok(PipelineOutcome::default());
        }

        info!(batches = batches.len(), "replaying failed batches");
        // Replay each entry on its own so its attempt count carries over
        // into a fresh ledger record if it fails again.
        let mut total = PipelineOutcome::default();
        for batch in batches {
            let outcome = self.run_inner(batch.chunks, batch.attempts).await?;
            total.embedded_chunks += outcome.embedded_chunks;
            total.reused_embeddings += outcome.reused_embeddings;
            total.provider_calls += outcome.provider_calls;
            total.failed_batches += outcome.failed_batches;
        }
        Ok(total)
    }

    async fn write_through(&self, chunks: &[PendingChunk], vector: &[f32]) -> Result<()> {
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .map(|p| VectorEntry {
                id: p.chunk.id.clone(),
                vector: vector.to_vec(),
                metadata: VectorMetadata::from_chunk(&p.chunk, &p.content),
            })
            .collect();
        self.vectors.add_batch(entries).await?;

        let mut bm25 = self.bm25.write().await;
        for p in chunks {
            bm25.add_chunk(&p.chunk.id, &p.content);
        }
        Ok(())
    }
}

struct BatchResult {
    vectors: Vec<Vec<f32>>,
}

/// Pack items into batches under the token budget, preserving order.
/// An item over the budget on its own is truncated at a char boundary.
fn plan_batches(items: Vec<EmbedItem>, budget: usize) -> Vec<Vec<EmbedItem>> {
    let mut batches: Vec<Vec<EmbedItem>> = Vec::new();
    let mut current: Vec<EmbedItem> = Vec::new();
    let mut current_tokens = 0usize;

    for mut item in items {
        let mut tokens = estimate_tokens(&item.text);
        if tokens > budget {
            // estimate_tokens rounds up by one, so a text that fills the
            // whole budget in chars would still estimate one over it.
            let max_chars = budget.saturating_sub(1).saturating_mul(4);
            let cut = item
                .text
                .char_indices()
                .take_while(|(i, _)| *i < max_chars)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            item.text.truncate(cut);
            tokens = estimate_tokens(&item.text);
            debug!(hash = %item.content_hash, "truncated oversized embedding input");
        }
        if !current.is_empty() && current_tokens + tokens > budget {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

async fn embed_batch_with_retry(
    batch: Vec<EmbedItem>,
    provider: Arc<dyn EmbeddingProvider>,
    throttle: Arc<Throttle>,
    semaphore: Arc<Semaphore>,
    config: PipelineConfig,
) -> (Vec<EmbedItem>, Result<BatchResult, String>, usize) {
    let _permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => return (batch, Err("pipeline shut down".to_string()), 0),
    };

    let texts: Vec<String> = batch.iter().map(|i| i.text.clone()).collect();
    let expected_dims = provider.dimensions();
    let mut calls = 0usize;
    let mut backoff = config.initial_backoff;
    let mut last_error = String::new();

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_backoff);
        }
        throttle.pace().await;
        calls += 1;

        match provider.embed_batch(&texts).await {
            Ok(result) => {
                throttle.on_success();
                if let Some(bad) = result.vectors.iter().find(|v| v.len() != expected_dims) {
                    let err = IndexError::DimensionMismatch {
                        expected: expected_dims,
                        got: bad.len(),
                    };
                    return (batch, Err(err.to_string()), calls);
                }
                if result.vectors.len() != texts.len() {
                    return (
                        batch,
                        Err(format!(
                            "provider returned {} vectors for {} inputs",
                            result.vectors.len(),
                            texts.len()
                        )),
                        calls,
                    );
                }
                return (
                    batch,
                    Ok(BatchResult {
                        vectors: result.vectors,
                    }),
                    calls,
                );
            }
            Err(e) => {
                last_error = e.to_string();
                match e.kind {
                    EmbedErrorKind::RateLimited => {
                        throttle.on_rate_limit();
                        debug!(attempt, "rate limited, backing off");
                    }
                    EmbedErrorKind::Transient => {
                        debug!(attempt, error = %last_error, "transient embedding failure");
                    }
                    EmbedErrorKind::NonRetryable => {
                        return (batch, Err(last_error), calls);
                    }
                }
            }
        }
    }

    (batch, Err(last_error), calls)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
