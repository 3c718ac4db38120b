//! Orphan garbage collection and index health checks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::search::bm25::Bm25Index;
use crate::store::Store;
use crate::vector::{VectorIndex, VectorMetadata};

pub const LAST_GC_KEY: &str = "last_gc";

/// What one garbage collection pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub orphan_chunks: usize,
    pub orphan_embeddings: usize,
}

/// What a health check found and repaired.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    /// Indexed files that no longer exist on disk.
    pub missing_files: Vec<String>,
    /// Chunks removed because their file vanished.
    pub removed_chunks: usize,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether garbage collection should run after this pass.
///
/// Runs on the interval, or early when the pass removed chunks and the
/// embedding pool has grown well past the live chunk count.
pub async fn gc_due(
    store: &Arc<dyn Store>,
    branch: &str,
    interval: Duration,
    orphan_threshold: usize,
    removed_this_pass: bool,
) -> Result<bool> {
    let last = match store.meta_get(LAST_GC_KEY).await? {
        Some(value) => value.parse::<u64>().unwrap_or(0),
        None => return Ok(true),
    };
    let elapsed = unix_now().saturating_sub(last);
    if elapsed >= interval.as_secs() {
        return Ok(true);
    }
    if removed_this_pass {
        let stats = store.stats(branch).await?;
        let excess = stats.embedding_count.saturating_sub(stats.chunk_count);
        if excess > orphan_threshold {
            debug!(excess, orphan_threshold, "early gc triggered");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Remove chunks no branch references, then embeddings no chunk references,
/// keeping the vector and lexical indexes in step.
pub async fn run_gc(
    store: &Arc<dyn Store>,
    vectors: &Arc<dyn VectorIndex>,
    bm25: &Arc<RwLock<Bm25Index>>,
) -> Result<GcReport> {
    let orphan_ids = store.remove_orphan_chunks().await?;
    for id in &orphan_ids {
        vectors.remove(id).await?;
    }
    {
        let mut bm25 = bm25.write().await;
        for id in &orphan_ids {
            bm25.remove_chunk(id);
        }
    }

    // Embeddings only orphan after their chunks are gone.
    let orphan_embeddings = store.remove_orphan_embeddings().await?;

    store
        .meta_set(LAST_GC_KEY, &unix_now().to_string())
        .await?;

    let report = GcReport {
        orphan_chunks: orphan_ids.len(),
        orphan_embeddings,
    };
    if report.orphan_chunks > 0 || report.orphan_embeddings > 0 {
        info!(
            chunks = report.orphan_chunks,
            embeddings = report.orphan_embeddings,
            "garbage collection complete"
        );
    }
    Ok(report)
}

/// Compare indexed files against the working tree and drop entries for
/// files that vanished outside an indexing pass.
pub async fn health_check(
    root: &Path,
    store: &Arc<dyn Store>,
    vectors: &Arc<dyn VectorIndex>,
    bm25: &Arc<RwLock<Bm25Index>>,
) -> Result<HealthReport> {
    let mut by_file: HashMap<String, Vec<String>> = HashMap::new();
    for (id, meta) in vectors.all_metadata().await {
        let VectorMetadata { file_path, .. } = meta;
        by_file.entry(file_path).or_default().push(id);
    }

    let mut report = HealthReport::default();
    for (file_path, ids) in by_file {
        if root.join(&file_path).exists() {
            continue;
        }
        debug!(file = %file_path, "indexed file missing from disk");
        let deleted = store.delete_chunks_for_file(&file_path).await?;
        report.removed_chunks += deleted.len();
        {
            let mut bm25 = bm25.write().await;
            for id in &ids {
                bm25.remove_chunk(id);
            }
        }
        for id in &ids {
            vectors.remove(id).await?;
        }
        report.missing_files.push(file_path);
    }
    report.missing_files.sort();

    if !report.missing_files.is_empty() {
        info!(
            files = report.missing_files.len(),
            chunks = report.removed_chunks,
            "health check removed vanished files"
        );
    }
    Ok(report)
}
