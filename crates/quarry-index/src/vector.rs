//! Vector index abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunk::{Chunk, ChunkKind};
use crate::snapshot;

/// Payload stored alongside each vector, enough to render a search result
/// without consulting the chunk store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub language: String,
    pub content: String,
    pub content_hash: String,
}

impl VectorMetadata {
    pub fn from_chunk(chunk: &Chunk, content: &str) -> Self {
        Self {
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            kind: chunk.kind,
            name: chunk.name.clone(),
            language: chunk.language.clone(),
            content: content.to_string(),
            content_hash: chunk.content_hash.clone(),
        }
    }
}

/// A vector plus its metadata, keyed by chunk id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Nearest-neighbor store for chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn add_batch(&self, entries: Vec<VectorEntry>) -> Result<()>;

    /// Top `k` entries by cosine similarity, descending.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn count(&self) -> usize;

    async fn clear(&self) -> Result<()>;

    async fn save(&self) -> Result<()>;

    async fn load(&self) -> Result<()>;

    /// All `(id, metadata)` pairs. Used by health checks and GC.
    async fn all_metadata(&self) -> Vec<(String, VectorMetadata)>;

    /// Metadata for the given ids; absent ids are simply missing from the map.
    async fn metadata_batch(&self, ids: &[String]) -> HashMap<String, VectorMetadata>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredVector {
    vector: Vec<f32>,
    metadata: VectorMetadata,
}

/// Brute-force in-memory vector index with optional JSON persistence.
///
/// Exact cosine scan. At the scale of a single repository this is fast
/// enough and avoids approximate-recall surprises in tests.
pub struct MemoryVectorIndex {
    path: Option<PathBuf>,
    inner: RwLock<HashMap<String, StoredVector>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            path: None,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn add_batch(&self, entries: Vec<VectorEntry>) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.insert(
                entry.id,
                StoredVector {
                    vector: entry.vector,
                    metadata: entry.metadata,
                },
            );
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let inner = self.inner.read().await;
        let mut hits: Vec<VectorHit> = inner
            .iter()
            .map(|(id, stored)| VectorHit {
                id: id.clone(),
                score: cosine(query, &stored.vector),
                metadata: stored.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }

    async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    async fn clear(&self) -> Result<()> {
        self.inner.write().await.clear();
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let inner = self.inner.read().await;
            snapshot::write_json(path, &*inner)?;
            debug!(count = inner.len(), "saved vector index");
        }
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let loaded: HashMap<String, StoredVector> = snapshot::load_or_default(path);
            debug!(count = loaded.len(), "loaded vector index");
            *self.inner.write().await = loaded;
        }
        Ok(())
    }

    async fn all_metadata(&self) -> Vec<(String, VectorMetadata)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(id, stored)| (id.clone(), stored.metadata.clone()))
            .collect()
    }

    async fn metadata_batch(&self, ids: &[String]) -> HashMap<String, VectorMetadata> {
        let inner = self.inner.read().await;
        ids.iter()
            .filter_map(|id| {
                inner
                    .get(id)
                    .map(|stored| (id.clone(), stored.metadata.clone()))
            })
            .collect()
    }
}
