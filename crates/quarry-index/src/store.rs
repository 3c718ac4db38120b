//! Chunk, embedding and branch-catalog storage.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunk::Chunk;
use crate::snapshot;

/// An embedding in the content-addressed pool, keyed by `(model, content_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEmbedding {
    pub content_hash: String,
    pub model: String,
    pub vector: Vec<f32>,
    /// The exact text that was embedded, kept for re-embedding on model change.
    pub text: String,
}

/// Counters for one branch plus the shared pools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub branch_count: usize,
    /// Chunks cataloged under the queried branch.
    pub branch_chunk_count: usize,
}

/// Durable storage for chunks, the embedding pool, branch catalogs and
/// small key-value metadata.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_chunks(&self, chunks: Vec<Chunk>) -> Result<()>;

    async fn chunk(&self, id: &str) -> Result<Option<Chunk>>;

    async fn chunks_batch(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// All chunks recorded for a file, across branches.
    async fn chunks_for_file(&self, file_path: &str) -> Result<Vec<Chunk>>;

    async fn delete_chunks(&self, ids: &[String]) -> Result<()>;

    /// Delete every chunk for a file. Returns the deleted ids.
    async fn delete_chunks_for_file(&self, file_path: &str) -> Result<Vec<String>>;

    async fn embedding(&self, model: &str, content_hash: &str) -> Result<Option<StoredEmbedding>>;

    async fn put_embeddings(&self, embeddings: Vec<StoredEmbedding>) -> Result<()>;

    async fn has_embedding(&self, model: &str, content_hash: &str) -> Result<bool>;

    /// Which of `hashes` have no pooled embedding for `model`.
    async fn missing_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>>;

    /// Replace a branch's catalog with exactly `ids` (clear-then-insert).
    async fn set_branch_chunks(&self, branch: &str, ids: &HashSet<String>) -> Result<()>;

    async fn branch_chunks(&self, branch: &str) -> Result<HashSet<String>>;

    /// `(ahead, behind)`: chunks only in `left`, and chunks only in `right`.
    async fn branch_delta(&self, left: &str, right: &str) -> Result<(usize, usize)>;

    async fn meta_get(&self, key: &str) -> Result<Option<String>>;

    async fn meta_set(&self, key: &str, value: &str) -> Result<()>;

    async fn stats(&self, branch: &str) -> Result<StoreStats>;

    /// Delete chunks referenced by no branch catalog. Returns deleted ids.
    async fn remove_orphan_chunks(&self) -> Result<Vec<String>>;

    /// Delete pooled embeddings whose content hash no surviving chunk
    /// carries. Returns how many were deleted.
    async fn remove_orphan_embeddings(&self) -> Result<usize>;

    async fn clear(&self) -> Result<()>;

    async fn save(&self) -> Result<()>;

    async fn load(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreInner {
    chunks: HashMap<String, Chunk>,
    /// model -> content_hash -> embedding
    embeddings: HashMap<String, HashMap<String, StoredEmbedding>>,
    branches: HashMap<String, HashSet<String>>,
    meta: HashMap<String, String>,
}

/// In-memory store with optional JSON persistence.
pub struct MemoryStore {
    path: Option<PathBuf>,
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            path: None,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            inner: RwLock::new(StoreInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_chunks(&self, chunks: Vec<Chunk>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for chunk in chunks {
            inner.chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.inner.read().await.chunks.get(id).cloned())
    }

    async fn chunks_batch(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.chunks.get(id).cloned())
            .collect())
    }

    async fn chunks_for_file(&self, file_path: &str) -> Result<Vec<Chunk>> {
        let inner = self.inner.read().await;
        let mut chunks: Vec<Chunk> = inner
            .chunks
            .values()
            .filter(|c| c.file_path == file_path)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.start_line);
        Ok(chunks)
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for id in ids {
            inner.chunks.remove(id);
        }
        // Deleted chunks must not linger in any branch catalog.
        for catalog in inner.branches.values_mut() {
            for id in ids {
                catalog.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_chunks_for_file(&self, file_path: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .chunks
                .values()
                .filter(|c| c.file_path == file_path)
                .map(|c| c.id.clone())
                .collect()
        };
        self.delete_chunks(&ids).await?;
        Ok(ids)
    }

    async fn embedding(&self, model: &str, content_hash: &str) -> Result<Option<StoredEmbedding>> {
        Ok(self
            .inner
            .read()
            .await
            .embeddings
            .get(model)
            .and_then(|pool| pool.get(content_hash))
            .cloned())
    }

    async fn put_embeddings(&self, embeddings: Vec<StoredEmbedding>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for embedding in embeddings {
            inner
                .embeddings
                .entry(embedding.model.clone())
                .or_default()
                .insert(embedding.content_hash.clone(), embedding);
        }
        Ok(())
    }

    async fn has_embedding(&self, model: &str, content_hash: &str) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .embeddings
            .get(model)
            .map(|pool| pool.contains_key(content_hash))
            .unwrap_or(false))
    }

    async fn missing_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        let pool = inner.embeddings.get(model);
        Ok(hashes
            .iter()
            .filter(|hash| pool.map(|p| !p.contains_key(*hash)).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn set_branch_chunks(&self, branch: &str, ids: &HashSet<String>) -> Result<()> {
        self.inner
            .write()
            .await
            .branches
            .insert(branch.to_string(), ids.clone());
        Ok(())
    }

    async fn branch_chunks(&self, branch: &str) -> Result<HashSet<String>> {
        Ok(self
            .inner
            .read()
            .await
            .branches
            .get(branch)
            .cloned()
            .unwrap_or_default())
    }

    async fn branch_delta(&self, left: &str, right: &str) -> Result<(usize, usize)> {
        let inner = self.inner.read().await;
        let empty = HashSet::new();
        let left_set = inner.branches.get(left).unwrap_or(&empty);
        let right_set = inner.branches.get(right).unwrap_or(&empty);
        let ahead = left_set.difference(right_set).count();
        let behind = right_set.difference(left_set).count();
        Ok((ahead, behind))
    }

    async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.meta.get(key).cloned())
    }

    async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn stats(&self, branch: &str) -> Result<StoreStats> {
        let inner = self.inner.read().await;
        Ok(StoreStats {
            chunk_count: inner.chunks.len(),
            embedding_count: inner.embeddings.values().map(|p| p.len()).sum(),
            branch_count: inner.branches.len(),
            branch_chunk_count: inner.branches.get(branch).map(|s| s.len()).unwrap_or(0),
        })
    }

    async fn remove_orphan_chunks(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let live: HashSet<&String> = inner.branches.values().flatten().collect();
        let orphans: Vec<String> = inner
            .chunks
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for id in &orphans {
            inner.chunks.remove(id);
        }
        if !orphans.is_empty() {
            debug!(count = orphans.len(), "removed orphan chunks");
        }
        Ok(orphans)
    }

    async fn remove_orphan_embeddings(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let live_hashes: HashSet<String> = inner
            .chunks
            .values()
            .map(|c| c.content_hash.clone())
            .collect();
        let mut removed = 0;
        for pool in inner.embeddings.values_mut() {
            let before = pool.len();
            pool.retain(|hash, _| live_hashes.contains(hash));
            removed += before - pool.len();
        }
        if removed > 0 {
            debug!(count = removed, "removed orphan embeddings");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.write().await = StoreInner::default();
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let inner = self.inner.read().await;
            snapshot::write_json(path, &*inner)?;
        }
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let loaded: StoreInner = snapshot::load_or_default(path);
            debug!(
                chunks = loaded.chunks.len(),
                branches = loaded.branches.len(),
                "loaded store"
            );
            *self.inner.write().await = loaded;
        }
        Ok(())
    }
}
