//! Result cache for read-only tools.

use crate::tool::{ToolDefinition, ToolResult};
use lru::LruCache;
use relay_core::config::CacheConfig;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Name tokens that mark a tool as read-only when it does not say so itself.
pub const READ_ONLY_PATTERNS: &[&str] = &["list", "get", "find"];

/// Whether results of this tool may be cached. An explicit `read_only`
/// declaration wins; otherwise the operation part of the name (after the
/// last `.`) must contain a read-only pattern, case-insensitively
/// (`projects.list`, `crm.find_contact`, `projects.getById`).
pub fn is_read_only(def: &ToolDefinition) -> bool {
    if let Some(declared) = def.metadata.read_only {
        return declared;
    }
    let operation = def
        .name
        .rsplit_once('.')
        .map_or(def.name.as_str(), |(_, op)| op)
        .to_ascii_lowercase();
    READ_ONLY_PATTERNS.iter().any(|p| operation.contains(p))
}

struct CacheEntry {
    result: ToolResult,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct ResultCache {
    default_ttl: Duration,
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(default_ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            default_ttl,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.default_ttl_secs), config.capacity)
    }

    /// TTL for a tool: its own override, else the default.
    pub fn ttl_for(&self, def: &ToolDefinition) -> Duration {
        def.metadata
            .cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_ttl)
    }

    pub fn get(&self, key: &str) -> Option<ToolResult> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = entries.peek(key).map(|entry| entry.expires_at <= Instant::now());
        let hit = match expired {
            Some(false) => entries.get(key).map(|entry| entry.result.clone()),
            Some(true) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Tool cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store a successful result. Failures and zero TTLs are skipped.
    pub fn put(&self, key: &str, result: &ToolResult, ttl: Duration) {
        if !result.success || ttl.is_zero() {
            return;
        }
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).put(
            key.to_string(),
            CacheEntry {
                result: result.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}
