//! Parked work waiting for a caller to come back with a token.
//!
//! Entries expire after a fixed time-to-live and the store holds at most
//! `capacity` of them; the least recently parked entry is evicted first.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_SUSPENSION_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SUSPENSION_CAPACITY: usize = 1_024;

struct Parked<T> {
    parked_at: Instant,
    value: T,
}

pub struct SuspensionStore<T> {
    ttl: Duration,
    entries: Mutex<LruCache<String, Parked<T>>>,
}

impl<T> SuspensionStore<T> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn park(&self, token: impl Into<String>, value: T) {
        let token = token.into();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((evicted, _)) = entries.push(
            token.clone(),
            Parked {
                parked_at: Instant::now(),
                value,
            },
        ) {
            if evicted != token {
                debug!(token = %evicted, "Evicted oldest suspension");
            }
        }
    }

    /// Remove and return the entry for `token` unless it has expired.
    pub fn take(&self, token: &str) -> Option<T> {
        let parked = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop(token)?;
        if parked.parked_at.elapsed() >= self.ttl {
            debug!(token, "Suspension expired");
            return None;
        }
        Some(parked.value)
    }

    /// Live entries; expired ones are dropped on the way.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, parked)| parked.parked_at.elapsed() >= self.ttl)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            entries.pop(&token);
        }
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SuspensionStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_SUSPENSION_TTL, DEFAULT_SUSPENSION_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_single_use() {
        let store = SuspensionStore::new(Duration::from_secs(60), 4);
        store.park("a", 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.take("a"), Some(1));
        assert_eq!(store.take("a"), None);
    }

    #[test]
    fn expired_entries_are_gone() {
        let store = SuspensionStore::new(Duration::from_millis(10), 4);
        store.park("a", 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(store.take("a"), None);

        store.park("b", 2);
        std::thread::sleep(Duration::from_millis(25));
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = SuspensionStore::new(Duration::from_secs(60), 2);
        store.park("a", 1);
        store.park("b", 2);
        store.park("c", 3);
        assert_eq!(store.len(), 2);
        assert_eq!(store.take("a"), None);
        assert_eq!(store.take("c"), Some(3));
    }
}
