//! Query embedding cache.
//!
//! Bounded, insertion-order evicted, TTL-expired. Besides exact hits it
//! reuses embeddings for near-duplicate queries by Jaccard similarity over
//! token sets, so "parse config file" and "parsing config files" do not cost
//! two provider calls.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::search::bm25::tokenize;

#[derive(Debug, Clone)]
struct CacheEntry {
    query: String,
    vector: Vec<f32>,
    inserted_at: Instant,
    tokens: HashSet<String>,
}

/// Cache of query text to embedding vector.
#[derive(Debug)]
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    similarity_threshold: f64,
    entries: VecDeque<CacheEntry>,
}

fn query_tokens(query: &str) -> HashSet<String> {
    // Lenient tokenization keeps short identifiers that matter in queries.
    tokenize(query, true).into_iter().collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration, similarity_threshold: f64) -> Self {
        Self {
            capacity,
            ttl,
            similarity_threshold,
            entries: VecDeque::new(),
        }
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|e| e.inserted_at.elapsed() < ttl);
    }

    /// Look up an embedding for `query`, accepting a near-duplicate match.
    pub fn get(&mut self, query: &str) -> Option<Vec<f32>> {
        self.evict_expired();

        if let Some(entry) = self.entries.iter().find(|e| e.query == query) {
            debug!(query, "query cache exact hit");
            return Some(entry.vector.clone());
        }

        let tokens = query_tokens(query);
        if tokens.is_empty() {
            return None;
        }

        let best = self
            .entries
            .iter()
            .map(|e| (jaccard(&tokens, &e.tokens), e))
            .filter(|(sim, _)| *sim >= self.similarity_threshold)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((similarity, entry)) = best {
            debug!(query, similarity, matched = %entry.query, "query cache similarity hit");
            return Some(entry.vector.clone());
        }
        None
    }

    pub fn insert(&mut self, query: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        self.evict_expired();
        self.entries.retain(|e| e.query != query);
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CacheEntry {
            query: query.to_string(),
            vector,
            inserted_at: Instant::now(),
            tokens: query_tokens(query),
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> QueryCache {
        QueryCache::new(3, Duration::from_secs(60), 0.85)
    }

    #[test]
    fn test_exact_hit() {
        let mut cache = cache();
        cache.insert("parse config file", vec![1.0, 2.0]);
        assert_eq!(cache.get("parse config file"), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("something else entirely"), None);
    }

    #[test]
    fn test_near_duplicate_hit() {
        let mut cache = QueryCache::new(3, Duration::from_secs(60), 0.5);
        cache.insert("parse the config file", vec![1.0]);
        // Shares most tokens with the cached query.
        assert_eq!(cache.get("parse the config"), Some(vec![1.0]));
    }

    #[test]
    fn test_dissimilar_query_misses() {
        let mut cache = cache();
        cache.insert("database connection pooling", vec![1.0]);
        assert_eq!(cache.get("websocket frame parsing"), None);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = cache();
        cache.insert("first unique query", vec![1.0]);
        cache.insert("second unique query", vec![2.0]);
        cache.insert("third unique query", vec![3.0]);
        cache.insert("fourth unique query", vec![4.0]);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("first unique query"), None);
        assert_eq!(cache.get("fourth unique query"), Some(vec![4.0]));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = QueryCache::new(3, Duration::ZERO, 0.85);
        cache.insert("ephemeral search terms", vec![1.0]);
        assert_eq!(cache.get("ephemeral search terms"), None);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut cache = cache();
        cache.insert("stable query text", vec![1.0]);
        cache.insert("stable query text", vec![2.0]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("stable query text"), Some(vec![2.0]));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut cache = QueryCache::new(0, Duration::from_secs(60), 0.85);
        cache.insert("anything at all", vec![1.0]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_jaccard() {
        let a: HashSet<String> = ["one", "two", "three"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let b: HashSet<String> = ["two", "three", "four"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert_eq!(jaccard(&a, &a), 1.0);
    }
}
