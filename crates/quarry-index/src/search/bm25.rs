//! BM25 lexical index over chunk content.
//!
//! The whole index is held in memory and persisted as a single JSON
//! snapshot. At repository scale this stays small and makes updates trivially
//! consistent with the rest of the pass.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot;

pub const BM25_FILE: &str = "bm25.json";

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Lowercase and split on everything except alphanumerics and underscores.
/// Strict mode drops tokens of two characters or fewer; lenient keeps
/// two-character tokens (short identifiers like `db` or `fs`).
pub fn tokenize(text: &str, lenient: bool) -> Vec<String> {
    let min_len = if lenient { 2 } else { 3 };
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= min_len)
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Bm25Index {
    /// term -> set of doc ids containing it
    postings: HashMap<String, HashSet<String>>,
    /// doc id -> term -> occurrence count
    term_freqs: HashMap<String, HashMap<String, usize>>,
    /// doc id -> token count
    doc_lengths: HashMap<String, usize>,
    total_tokens: usize,
    lenient: bool,
}

impl Bm25Index {
    pub fn new(lenient: bool) -> Self {
        Self {
            lenient,
            ..Self::default()
        }
    }

    /// Index a document, replacing any previous version under the same id.
    pub fn add_chunk(&mut self, id: &str, content: &str) {
        if self.doc_lengths.contains_key(id) {
            self.remove_chunk(id);
        }

        let tokens = tokenize(content, self.lenient);
        let mut freqs: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *freqs.entry(token.clone()).or_insert(0) += 1;
        }
        for term in freqs.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.total_tokens += tokens.len();
        self.doc_lengths.insert(id.to_string(), tokens.len());
        self.term_freqs.insert(id.to_string(), freqs);
    }

    /// Remove a document. Returns false if it was not indexed.
    pub fn remove_chunk(&mut self, id: &str) -> bool {
        let Some(freqs) = self.term_freqs.remove(id) else {
            return false;
        };
        for term in freqs.keys() {
            if let Some(docs) = self.postings.get_mut(term) {
                docs.remove(id);
                if docs.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        if let Some(len) = self.doc_lengths.remove(id) {
            self.total_tokens -= len;
        }
        true
    }

    /// Score documents against `query` with Okapi BM25, normalized so the
    /// best hit scores at most 1.0. Results are sorted by descending score,
    /// ties broken by id for determinism.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let terms = tokenize(query, self.lenient);
        if terms.is_empty() || self.doc_lengths.is_empty() {
            return vec![];
        }

        let n = self.doc_lengths.len() as f32;
        let avg_len = self.total_tokens as f32 / n;

        let mut candidates: HashSet<&String> = HashSet::new();
        for term in &terms {
            if let Some(docs) = self.postings.get(term) {
                candidates.extend(docs);
            }
        }

        let mut scored: Vec<(String, f32)> = candidates
            .into_iter()
            .map(|id| {
                let doc_len = *self.doc_lengths.get(id).unwrap_or(&0) as f32;
                let freqs = self.term_freqs.get(id);
                let mut score = 0.0f32;
                for term in &terms {
                    let tf = freqs
                        .and_then(|f| f.get(term))
                        .copied()
                        .unwrap_or(0) as f32;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = self.postings.get(term).map(|d| d.len()).unwrap_or(0) as f32;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let denom = tf + K1 * (1.0 - B + B * doc_len / avg_len);
                    score += idf * (tf * (K1 + 1.0)) / denom;
                }
                (id.clone(), score)
            })
            .filter(|(_, s)| *s > 0.0)
            .collect();

        // Dividing by at least 1.0 keeps weak matches from being inflated
        // to a perfect score.
        let max = scored
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0f32, f32::max)
            .max(1.0);
        for (_, score) in &mut scored {
            *score /= max;
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        scored
    }

    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.doc_lengths.contains_key(id)
    }

    pub fn clear(&mut self) {
        self.postings.clear();
        self.term_freqs.clear();
        self.doc_lengths.clear();
        self.total_tokens = 0;
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        snapshot::write_json(&dir.join(BM25_FILE), self)
    }

    /// Load the snapshot or start empty. The tokenizer mode always comes
    /// from the current configuration, not from the snapshot.
    pub fn load_or_default(dir: &Path, lenient: bool) -> Self {
        let mut index: Self = snapshot::load_or_default(&dir.join(BM25_FILE));
        index.lenient = lenient;
        debug!(docs = index.doc_count(), "loaded lexical index");
        index
    }
}
