//! Chunk data model and content-addressed identities.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of source element a chunk was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Method,
    Struct,
    Enum,
    Trait,
    Impl,
    Class,
    Module,
    /// Generic/unclassified text; dropped when indexing in semantic-only mode.
    Other,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Struct => "struct",
            ChunkKind::Enum => "enum",
            ChunkKind::Trait => "trait",
            ChunkKind::Impl => "impl",
            ChunkKind::Class => "class",
            ChunkKind::Module => "module",
            ChunkKind::Other => "other",
        }
    }

    /// Whether this is the generic, unclassified kind.
    pub fn is_generic(&self) -> bool {
        matches!(self, ChunkKind::Other)
    }
}

/// A parsed unit of source code with a stable identity and a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic hash of `(file_path, span, content)`.
    pub id: String,
    /// Hash of content alone; the embedding-reuse key.
    pub content_hash: String,
    /// Path relative to the index root.
    pub file_path: String,
    /// Starting line number (1-indexed).
    pub start_line: usize,
    /// Ending line number (1-indexed).
    pub end_line: usize,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub language: String,
}

/// Deterministic chunk id over `(file_path, span, content)`.
///
/// Stable across runs and processes; changes only when the chunk's own span
/// or content changes.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of chunk content alone. Identical content anywhere yields the same
/// hash, which is what enables cross-location embedding reuse.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rough token estimate used for batch budgeting (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

/// A chunk queued for embedding, carrying the text sent to the provider and
/// the raw content for lexical indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingChunk {
    pub chunk: Chunk,
    /// Provider input: raw content prefixed with its location, so similar
    /// snippets in different modules stay distinguishable.
    pub embed_text: String,
    /// Raw content for the BM25 index.
    pub content: String,
}

impl PendingChunk {
    pub fn new(chunk: Chunk, content: String) -> Self {
        let embed_text = format!("{}\n{}", chunk.file_path, content);
        Self {
            chunk,
            embed_text,
            content,
        }
    }
}
