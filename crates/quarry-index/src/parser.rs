//! Parsing seam between the scanner and the diff engine.
//!
//! The indexer is generic over how files are split into chunks. A parser
//! takes whole files and returns raw chunks with spans; the diff engine
//! assigns identities and decides what actually needs work.

use async_trait::async_trait;

use crate::chunk::ChunkKind;

/// A file picked up by the scanner, with content already read.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the index root.
    pub path: String,
    pub content: String,
}

/// A chunk as produced by a parser, before identity assignment.
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub content: String,
    /// Starting line number (1-indexed).
    pub start_line: usize,
    /// Ending line number (1-indexed).
    pub end_line: usize,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub language: String,
}

/// Result of parsing one file.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// Path relative to the index root.
    pub path: String,
    /// Content hash of the file as parsed.
    pub hash: String,
    /// Chunks in file order. Empty means the parser could not produce any.
    pub chunks: Vec<RawChunk>,
}

/// Splits source files into chunks.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse_files(&self, files: &[SourceFile]) -> anyhow::Result<Vec<ParsedFile>>;
}
