//! Hybrid search: linear fusion of semantic and lexical rankings.

pub mod bm25;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::ChunkKind;
use crate::vector::VectorMetadata;

/// Candidates fetched from each source per requested result, so that
/// post-filters still leave enough to fill the page.
pub const OVERFETCH_FACTOR: usize = 4;

/// Placeholder returned when on-disk refresh cannot read the file.
pub const UNAVAILABLE_CONTENT: &str = "<content unavailable>";

/// One hybrid search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub kind: ChunkKind,
    pub name: Option<String>,
    pub language: String,
    /// Fused score.
    pub score: f32,
    /// Cosine similarity from the semantic source, if it ranked this hit.
    pub vector_score: Option<f32>,
    /// Normalized BM25 score from the lexical source, if it ranked this hit.
    pub bm25_score: Option<f32>,
}

/// Metadata post-filter applied after fusion.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub extensions: Vec<String>,
    pub path_prefix: Option<String>,
    pub kinds: Vec<ChunkKind>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<ChunkKind>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty() && self.path_prefix.is_none() && self.kinds.is_empty()
    }

    pub fn matches(&self, meta: &VectorMetadata) -> bool {
        if !self.extensions.is_empty() {
            let ext = Path::new(&meta.file_path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if !self.extensions.iter().any(|allowed| allowed == ext) {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !meta.file_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&meta.kind) {
            return false;
        }
        true
    }
}

/// Options for one search call.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// Lexical weight in `[0.0, 1.0]`. 0.0 is purely semantic, 1.0 purely
    /// lexical.
    pub hybrid_weight: f32,
    pub min_score: f32,
    /// Re-read result content from the working tree instead of returning
    /// the indexed copy.
    pub refresh_from_disk: bool,
    pub filter: SearchFilter,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            hybrid_weight: 0.3,
            min_score: 0.0,
            refresh_from_disk: false,
            filter: SearchFilter::default(),
        }
    }
}

/// Linearly fuse semantic and lexical rankings.
///
/// `fused = semantic * (1 - weight) + lexical * weight`. At either weight
/// boundary the other source is not consulted at all, so the fused order is
/// exactly the single-source order.
pub fn fuse(
    semantic: &[(String, f32)],
    lexical: &[(String, f32)],
    weight: f32,
) -> Vec<(String, f32)> {
    let mut fused: HashMap<String, f32> = HashMap::new();

    if weight < 1.0 {
        for (id, score) in semantic {
            *fused.entry(id.clone()).or_insert(0.0) += score * (1.0 - weight);
        }
    }
    if weight > 0.0 {
        for (id, score) in lexical {
            *fused.entry(id.clone()).or_insert(0.0) += score * weight;
        }
    }

    let mut results: Vec<(String, f32)> = fused.into_iter().collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results
}

/// Slice the chunk's line span out of the file as it exists on disk now.
/// Falls back to a placeholder if the file is gone or the span is invalid.
pub fn refresh_content(root: &Path, meta: &VectorMetadata) -> String {
    let path = root.join(&meta.file_path);
    let Ok(content) = std::fs::read_to_string(&path) else {
        debug!(path = %path.display(), "content refresh failed, file unreadable");
        return UNAVAILABLE_CONTENT.to_string();
    };

    let lines: Vec<&str> = content.lines().collect();
    if meta.start_line == 0 || meta.start_line > lines.len() {
        return UNAVAILABLE_CONTENT.to_string();
    }
    let end = meta.end_line.min(lines.len());
    lines[meta.start_line - 1..end].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn meta(path: &str, kind: ChunkKind) -> VectorMetadata {
        VectorMetadata {
            file_path: path.to_string(),
            start_line: 1,
            end_line: 1,
            kind,
            name: None,
            language: "rust".to_string(),
            content: "fn x() {}".to_string(),
            content_hash: "h".to_string(),
        }
    }

    #[test]
    fn test_fuse_combines_both_sources() {
        let semantic = vec![("a".to_string(), 0.9), ("b".to_string(), 0.5)];
        let lexical = vec![("b".to_string(), 1.0), ("c".to_string(), 0.8)];

        let fused = fuse(&semantic, &lexical, 0.3);
        let scores: HashMap<_, _> = fused.iter().cloned().collect();

        assert!((scores["a"] - 0.9 * 0.7).abs() < 1e-6);
        assert!((scores["b"] - (0.5 * 0.7 + 1.0 * 0.3)).abs() < 1e-6);
        assert!((scores["c"] - 0.8 * 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_weight_zero_is_pure_semantic_order() {
        let semantic = vec![
            ("a".to_string(), 0.9),
            ("b".to_string(), 0.7),
            ("c".to_string(), 0.3),
        ];
        // Lexical strongly disagrees; it must be ignored entirely.
        let lexical = vec![("c".to_string(), 1.0), ("z".to_string(), 1.0)];

        let fused = fuse(&semantic, &lexical, 0.0);
        let order: Vec<_> = fused.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_weight_one_is_pure_lexical_order() {
        let semantic = vec![("z".to_string(), 1.0)];
        let lexical = vec![
            ("a".to_string(), 1.0),
            ("b".to_string(), 0.6),
            ("c".to_string(), 0.2),
        ];

        let fused = fuse(&semantic, &lexical, 1.0);
        let order: Vec<_> = fused.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_fuse_tie_breaks_by_id() {
        let semantic = vec![("b".to_string(), 0.5), ("a".to_string(), 0.5)];
        let fused = fuse(&semantic, &[], 0.0);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[1].0, "b");
    }

    #[test]
    fn test_filter_by_extension_prefix_and_kind() {
        let filter = SearchFilter::new()
            .with_extensions(vec!["rs".to_string()])
            .with_path_prefix("src/")
            .with_kinds(vec![ChunkKind::Function]);

        assert!(filter.matches(&meta("src/lib.rs", ChunkKind::Function)));
        assert!(!filter.matches(&meta("src/lib.py", ChunkKind::Function)));
        assert!(!filter.matches(&meta("tests/lib.rs", ChunkKind::Function)));
        assert!(!filter.matches(&meta("src/lib.rs", ChunkKind::Struct)));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = SearchFilter::new();
        assert!(filter.is_empty());
        assert!(filter.matches(&meta("anything.py", ChunkKind::Other)));
    }

    #[test]
    fn test_refresh_content_slices_span() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "line1\nline2\nline3\nline4\n").unwrap();

        let mut m = meta("a.rs", ChunkKind::Function);
        m.start_line = 2;
        m.end_line = 3;
        assert_eq!(refresh_content(dir.path(), &m), "line2\nline3");
    }

    #[test]
    fn test_refresh_content_handles_missing_file_and_bad_span() {
        let dir = tempdir().unwrap();

        let m = meta("gone.rs", ChunkKind::Function);
        assert_eq!(refresh_content(dir.path(), &m), UNAVAILABLE_CONTENT);

        fs::write(dir.path().join("a.rs"), "only\n").unwrap();
        let mut m = meta("a.rs", ChunkKind::Function);
        m.start_line = 10;
        m.end_line = 12;
        assert_eq!(refresh_content(dir.path(), &m), UNAVAILABLE_CONTENT);
    }

    #[test]
    fn test_refresh_content_clamps_end_line() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "one\ntwo\n").unwrap();

        let mut m = meta("a.rs", ChunkKind::Function);
        m.start_line = 1;
        m.end_line = 99;
        assert_eq!(refresh_content(dir.path(), &m), "one\ntwo");
    }
}
