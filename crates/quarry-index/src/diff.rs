//! Incremental diffing: decide what actually needs work.
//!
//! Two layers of skipping keep repeat passes cheap. The file layer compares
//! content hashes against the last completed pass and drops unchanged files
//! before parsing. The chunk layer compares parsed chunks against the branch
//! catalog and only queues chunks that were not live last pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::chunk::{chunk_id, content_hash, Chunk, PendingChunk};
use crate::manifest::FileHashCache;
use crate::parser::{ParsedFile, SourceFile};
use crate::scan::HashedFile;
use crate::store::Store;

/// File-level split of a scan against the hash cache.
#[derive(Debug, Default)]
pub struct FileSplit {
    /// Paths whose content hash matches the last completed pass.
    pub unchanged: Vec<String>,
    /// Files that must be parsed this pass.
    pub to_parse: Vec<SourceFile>,
    /// Hash of every scanned file, for the cache update after the pass.
    pub current_hashes: HashMap<String, String>,
}

/// Partition scanned files into unchanged and needs-parsing.
pub fn split_files(cache: &FileHashCache, scanned: Vec<HashedFile>) -> FileSplit {
    let mut split = FileSplit::default();
    for hashed in scanned {
        split
            .current_hashes
            .insert(hashed.file.path.clone(), hashed.hash.clone());
        if cache.unchanged(&hashed.file.path, &hashed.hash) {
            split.unchanged.push(hashed.file.path);
        } else {
            split.to_parse.push(hashed.file);
        }
    }
    debug!(
        unchanged = split.unchanged.len(),
        to_parse = split.to_parse.len(),
        "split scanned files"
    );
    split
}

/// Chunk-level classification for one pass.
#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// Chunks that need embedding and storage.
    pub pending: Vec<PendingChunk>,
    /// Chunks already present with identical identity.
    pub existing: usize,
    /// Every chunk id live on this branch after the pass.
    pub live_ids: HashSet<String>,
    /// Previously live ids that no longer exist, sorted for determinism.
    pub removed: Vec<String>,
    /// Files the parser produced zero chunks for.
    pub parse_failures: Vec<String>,
}

/// Classifies parsed chunks against prior index state.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    /// Hard cap on chunks taken from one file.
    pub max_chunks_per_file: usize,
    /// Drop generic (unclassified) chunks entirely.
    pub semantic_only: bool,
}

impl DiffEngine {
    pub fn new(max_chunks_per_file: usize, semantic_only: bool) -> Self {
        Self {
            max_chunks_per_file,
            semantic_only,
        }
    }

    /// Classify one pass worth of parse output.
    ///
    /// `unchanged` files carry their previously live chunks forward without
    /// re-parsing. `prev_live` is the branch catalog before this pass.
    pub async fn classify(
        &self,
        parsed: &[ParsedFile],
        unchanged: &[String],
        prev_live: &HashSet<String>,
        store: &Arc<dyn Store>,
    ) -> Result<DiffOutcome> {
        let mut outcome = DiffOutcome::default();

        // Unchanged files keep their chunks from the previous pass. Only
        // chunks that were actually live on this branch carry forward.
        for path in unchanged {
            for chunk in store.chunks_for_file(path).await? {
                if prev_live.contains(&chunk.id) {
                    outcome.live_ids.insert(chunk.id);
                    outcome.existing += 1;
                }
            }
        }

        for file in parsed {
            if file.chunks.is_empty() {
                outcome.parse_failures.push(file.path.clone());
                continue;
            }

            let mut taken = 0;
            for raw in &file.chunks {
                if self.semantic_only && raw.kind.is_generic() {
                    continue;
                }
                if taken >= self.max_chunks_per_file {
                    debug!(path = %file.path, cap = self.max_chunks_per_file, "chunk cap reached");
                    break;
                }
                taken += 1;

                let id = chunk_id(&file.path, raw.start_line, raw.end_line, &raw.content);
                outcome.live_ids.insert(id.clone());

                // Existing means live on this branch last pass. A store row
                // alone is not enough: rows for removed chunks linger until
                // orphan GC, and a restored chunk must be re-queued so its
                // vector and lexical entries are rebuilt. The embedding pool
                // makes that rebuild free.
                if prev_live.contains(&id) {
                    outcome.existing += 1;
                    continue;
                }

                let chunk = Chunk {
                    id,
                    content_hash: content_hash(&raw.content),
                    file_path: file.path.clone(),
                    start_line: raw.start_line,
                    end_line: raw.end_line,
                    kind: raw.kind,
                    name: raw.name.clone(),
                    language: raw.language.clone(),
                };
                outcome
                    .pending
                    .push(PendingChunk::new(chunk, raw.content.clone()));
            }
        }

        outcome.removed = prev_live
            .difference(&outcome.live_ids)
            .cloned()
            .collect();
        outcome.removed.sort();

        debug!(
            pending = outcome.pending.len(),
            existing = outcome.existing,
            removed = outcome.removed.len(),
            parse_failures = outcome.parse_failures.len(),
            "classified chunks"
        );
        Ok(outcome)
    }
}
