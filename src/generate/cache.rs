//! Answer cache keyed on `(question, context digest)`.
//!
//! A cache hit short-circuits the external generation call entirely: the
//! same question asked against the same document context produces the same
//! draft, which both saves spend and guarantees idempotency when a run is
//! re-executed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::extract::{ExtractedQuestion, QuestionKind};

use super::context::ContextDigest;

/// Default capacity of the answer cache.
const DEFAULT_MAX_ENTRIES: usize = 4096;

/// Cache key derived from `(question.text, question.kind, context_digest)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnswerKey(String);

impl AnswerKey {
    /// Builds the key for a question/context pair.
    pub fn for_question(question: &ExtractedQuestion, digest: &ContextDigest) -> Self {
        Self::from_parts(&question.text, question.kind, digest.as_str())
    }

    /// Builds the key from its raw parts.
    ///
    /// Parts are framed with separator bytes so that no concatenation of
    /// one triple can collide with another.
    pub fn from_parts(text: &str, kind: QuestionKind, digest: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0x1f]);
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(digest.as_bytes());
        AnswerKey(hex::encode(hasher.finalize()))
    }

    /// Get the key string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cache entry with access metadata for LRU eviction.
#[derive(Debug, Clone)]
struct CacheEntry {
    answer: String,
    last_accessed: Instant,
}

/// Cache statistics for monitoring and cost accounting.
#[derive(Debug, Clone, Default)]
pub struct AnswerCacheStats {
    /// Total cache hits; each one is an external call that was not made.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Total entries added.
    pub entries_added: u64,
    /// Total entries evicted.
    pub entries_evicted: u64,
}

impl AnswerCacheStats {
    /// Calculate the cache hit rate, 0.0 when the cache was never read.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe answer cache with LRU eviction.
pub struct AnswerCache {
    entries: RwLock<HashMap<AnswerKey, CacheEntry>>,
    max_entries: usize,
    stats: RwLock<AnswerCacheStats>,
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl AnswerCache {
    /// Creates a cache bounded to `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            stats: RwLock::new(AnswerCacheStats::default()),
        }
    }

    /// Looks up an answer, recording a hit or miss.
    pub fn get(&self, key: &AnswerKey) -> Option<String> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let found = entries.get_mut(key).map(|entry| {
            entry.last_accessed = Instant::now();
            entry.answer.clone()
        });

        let mut stats = self.stats.write().expect("stats lock poisoned");
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Stores an answer, evicting the least recently used entry at capacity.
    pub fn insert(&self, key: AnswerKey, answer: impl Into<String>) {
        let mut entries = self.entries.write().expect("cache lock poisoned");

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.stats.write().expect("stats lock poisoned").entries_evicted += 1;
            }
        }

        entries.insert(
            key,
            CacheEntry {
                answer: answer.into(),
                last_accessed: Instant::now(),
            },
        );
        self.stats.write().expect("stats lock poisoned").entries_added += 1;
    }

    /// Current cache statistics.
    pub fn stats(&self) -> AnswerCacheStats {
        self.stats.read().expect("stats lock poisoned").clone()
    }

    /// Number of cached answers.
    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared answer cache handle.
pub type SharedAnswerCache = Arc<AnswerCache>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str, digest: &str) -> AnswerKey {
        AnswerKey::from_parts(text, QuestionKind::Essay, digest)
    }

    #[test]
    fn test_key_deterministic() {
        let a = key("Why us?", "digest-1");
        let b = key("Why us?", "digest-1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_varies_with_each_part() {
        let base = key("Why us?", "digest-1");
        assert_ne!(base, key("Why them?", "digest-1"));
        assert_ne!(base, key("Why us?", "digest-2"));
        assert_ne!(
            base,
            AnswerKey::from_parts("Why us?", QuestionKind::ShortAnswer, "digest-1")
        );
    }

    #[test]
    fn test_hit_and_miss_accounting() {
        let cache = AnswerCache::new(10);
        let k = key("Why us?", "d");

        assert!(cache.get(&k).is_none());
        cache.insert(k.clone(), "Because of the mission.");
        assert_eq!(cache.get(&k).as_deref(), Some("Because of the mission."));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = AnswerCache::new(2);

        cache.insert(key("q1", "d"), "a1");
        cache.insert(key("q2", "d"), "a2");

        // Touch q1 so q2 becomes the LRU entry.
        assert!(cache.get(&key("q1", "d")).is_some());

        cache.insert(key("q3", "d"), "a3");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("q1", "d")).is_some());
        assert!(cache.get(&key("q2", "d")).is_none());
        assert_eq!(cache.stats().entries_evicted, 1);
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let cache = AnswerCache::new(1);
        let k = key("q1", "d");

        cache.insert(k.clone(), "v1");
        cache.insert(k.clone(), "v2");

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&k).as_deref(), Some("v2"));
        assert_eq!(cache.stats().entries_evicted, 0);
    }

    #[test]
    fn test_shared_cache_is_cheaply_clonable() {
        let cache: SharedAnswerCache = Arc::new(AnswerCache::new(10));
        let clone = Arc::clone(&cache);

        cache.insert(key("q", "d"), "a");
        assert_eq!(clone.len(), 1);
    }
}
