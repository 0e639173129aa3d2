//! Duplicate-call detection: a successful result is remembered under the
//! call's fingerprint and returned verbatim for repeats within the window.

use crate::tool::ToolResult;
use chrono::{DateTime, Utc};
use lru::LruCache;
use relay_core::config::IdempotencyConfig;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    /// Identifier assigned to the original successful result.
    pub result_id: Uuid,
    pub result: ToolResult,
    pub recorded_at: DateTime<Utc>,
}

pub struct IdempotencyStore {
    window: Duration,
    records: Mutex<LruCache<String, IdempotencyRecord>>,
}

impl IdempotencyStore {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            window,
            records: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.capacity)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// A prior successful result for `key`, if it is still inside the window.
    pub fn lookup(&self, key: &str) -> Option<IdempotencyRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match records.get(key) {
            Some(record) => {
                let age = (Utc::now() - record.recorded_at).to_std().unwrap_or(Duration::ZERO);
                age < self.window
            }
            None => return None,
        };
        if fresh {
            records.get(key).cloned()
        } else {
            records.pop(key);
            None
        }
    }

    /// Remember a successful result. Failures are never recorded.
    pub fn record(&self, key: &str, result: &ToolResult) -> Option<Uuid> {
        if !result.success {
            return None;
        }
        let record = IdempotencyRecord {
            result_id: Uuid::new_v4(),
            result: result.clone(),
            recorded_at: Utc::now(),
        };
        let id = record.result_id;
        debug!(key, result_id = %id, "Recorded idempotency entry");
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(key.to_string(), record);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ErrorKind;
    use serde_json::json;

    #[test]
    fn returns_recorded_success() {
        let store = IdempotencyStore::new(Duration::from_secs(60), 16);
        let result = ToolResult::ok(json!({"id": 42}));
        let id = store.record("k1", &result).unwrap();

        let hit = store.lookup("k1").unwrap();
        assert_eq!(hit.result_id, id);
        assert_eq!(hit.result, result);
        assert!(store.lookup("k2").is_none());
    }

    #[test]
    fn failures_are_not_recorded() {
        let store = IdempotencyStore::new(Duration::from_secs(60), 16);
        let failure = ToolResult::failure(ErrorKind::ExecutionError, "boom");
        assert!(store.record("k1", &failure).is_none());
        assert!(store.lookup("k1").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn records_expire_after_window() {
        let store = IdempotencyStore::new(Duration::from_millis(20), 16);
        store.record("k1", &ToolResult::ok(json!(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.lookup("k1").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn capacity_bounds_the_store() {
        let store = IdempotencyStore::new(Duration::from_secs(60), 2);
        for k in ["a", "b", "c"] {
            store.record(k, &ToolResult::ok(json!(k)));
        }
        assert_eq!(store.len(), 2);
        assert!(store.lookup("a").is_none());
    }
}
