//! Per-service circuit breakers with persistable state.
//!
//! Closed → Open after `failure_threshold` consecutive failures.
//! Open → HalfOpen once the cool-down has elapsed; one probe at a time.
//! HalfOpen → Closed after `success_threshold` successful probes, or back
//! to Open on any probe failure.

use chrono::{DateTime, Utc};
use relay_core::config::BreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted form of one service's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerSnapshot {
    fn closed(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down: Duration,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(c: &BreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold.max(1),
            success_threshold: c.success_threshold.max(1),
            cool_down: Duration::from_secs(c.cool_down_secs),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

/// Whether a call may reach the service.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// `probe` is set for the single trial call of a half-open breaker.
    Allowed { probe: bool },
    Rejected { retry_after: Duration },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where breaker state survives restarts.
pub trait BreakerStore: Send + Sync {
    fn load(&self) -> Result<Vec<BreakerSnapshot>, StoreError>;
    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryBreakerStore {
    snapshots: Mutex<BTreeMap<String, BreakerSnapshot>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for InMemoryBreakerStore {
    fn load(&self) -> Result<Vec<BreakerSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(snapshot.service.clone(), snapshot.clone());
        Ok(())
    }
}

/// All breakers in one JSON file, rewritten through a temp file on each save.
pub struct JsonFileBreakerStore {
    path: PathBuf,
    snapshots: Mutex<BTreeMap<String, BreakerSnapshot>>,
}

impl JsonFileBreakerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshots = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let list: Vec<BreakerSnapshot> = if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            };
            list.into_iter().map(|s| (s.service.clone(), s)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            snapshots: Mutex::new(snapshots),
        })
    }
}

impl BreakerStore for JsonFileBreakerStore {
    fn load(&self) -> Result<Vec<BreakerSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(snapshot.service.clone(), snapshot.clone());
        let list: Vec<_> = snapshots.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

struct Breaker {
    snapshot: BreakerSnapshot,
    probe_in_flight: bool,
}

/// Breakers keyed by service name, shared across runs.
pub struct CircuitBreakers {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
    store: Arc<dyn BreakerStore>,
}

impl CircuitBreakers {
    /// Restore persisted breakers from `store`. A store that fails to load
    /// is logged and treated as empty.
    pub fn new(settings: BreakerSettings, store: Arc<dyn BreakerStore>) -> Self {
        let restored = match store.load() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "Failed to load circuit breaker state");
                Vec::new()
            }
        };
        if !restored.is_empty() {
            info!(count = restored.len(), "Restored circuit breaker state");
        }
        let breakers = restored
            .into_iter()
            .map(|snapshot| {
                let service = snapshot.service.clone();
                // a probe cannot survive a restart
                let breaker = Breaker {
                    snapshot,
                    probe_in_flight: false,
                };
                (service, Arc::new(Mutex::new(breaker)))
            })
            .collect();
        Self {
            settings,
            breakers: RwLock::new(breakers),
            store,
        }
    }

    pub fn in_memory(settings: BreakerSettings) -> Self {
        Self::new(settings, Arc::new(InMemoryBreakerStore::new()))
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn breaker(&self, service: &str) -> Arc<Mutex<Breaker>> {
        if let Some(b) = self.breakers.read().unwrap_or_else(|e| e.into_inner()).get(service) {
            return b.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Breaker {
                    snapshot: BreakerSnapshot::closed(service),
                    probe_in_flight: false,
                }))
            })
            .clone()
    }

    /// Called with the breaker's lock held so saves for one service reach
    /// the store in the order the transitions happened.
    fn persist(&self, snapshot: Option<BreakerSnapshot>) {
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.save(&snapshot) {
                warn!(service = %snapshot.service, error = %e, "Failed to persist circuit breaker state");
            }
        }
    }

    /// Decide whether a call to `service` may proceed.
    pub fn try_acquire(&self, service: &str) -> Admission {
        let breaker = self.breaker(service);
        let admission = {
            let mut b = breaker.lock().unwrap_or_else(|e| e.into_inner());
            let (admission, changed) = match b.snapshot.state {
                CircuitState::Closed => (Admission::Allowed { probe: false }, None),
                CircuitState::Open => {
                    let elapsed = b
                        .snapshot
                        .opened_at
                        .map(|at| (Utc::now() - at).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(self.settings.cool_down);
                    if elapsed >= self.settings.cool_down {
                        b.snapshot.state = CircuitState::HalfOpen;
                        b.snapshot.success_count = 0;
                        b.probe_in_flight = true;
                        info!(service, "Circuit half-open, admitting probe");
                        (Admission::Allowed { probe: true }, Some(b.snapshot.clone()))
                    } else {
                        (
                            Admission::Rejected {
                                retry_after: self.settings.cool_down - elapsed,
                            },
                            None,
                        )
                    }
                }
                CircuitState::HalfOpen => {
                    if b.probe_in_flight {
                        (Admission::Rejected { retry_after: Duration::ZERO }, None)
                    } else {
                        b.probe_in_flight = true;
                        (Admission::Allowed { probe: true }, None)
                    }
                }
            };
            self.persist(changed);
            admission
        };
        if let Admission::Rejected { retry_after } = &admission {
            debug!(service, retry_after_ms = retry_after.as_millis() as u64, "Circuit open, failing fast");
        }
        admission
    }

    pub fn record_success(&self, service: &str) {
        let breaker = self.breaker(service);
        let mut b = breaker.lock().unwrap_or_else(|e| e.into_inner());
        let changed = match b.snapshot.state {
            CircuitState::Closed => {
                if b.snapshot.failure_count == 0 {
                    None
                } else {
                    b.snapshot.failure_count = 0;
                    Some(b.snapshot.clone())
                }
            }
            CircuitState::HalfOpen => {
                b.probe_in_flight = false;
                b.snapshot.success_count += 1;
                if b.snapshot.success_count >= self.settings.success_threshold {
                    b.snapshot = BreakerSnapshot {
                        last_failure_at: b.snapshot.last_failure_at,
                        ..BreakerSnapshot::closed(service)
                    };
                    info!(service, "Circuit closed");
                }
                Some(b.snapshot.clone())
            }
            // late result of a call admitted before the breaker tripped
            CircuitState::Open => None,
        };
        self.persist(changed);
    }

    pub fn record_failure(&self, service: &str) {
        let breaker = self.breaker(service);
        let mut b = breaker.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        b.snapshot.last_failure_at = Some(now);
        match b.snapshot.state {
            CircuitState::Closed => {
                b.snapshot.failure_count += 1;
                if b.snapshot.failure_count >= self.settings.failure_threshold {
                    b.snapshot.state = CircuitState::Open;
                    b.snapshot.opened_at = Some(now);
                    warn!(
                        service,
                        failures = b.snapshot.failure_count,
                        cool_down_secs = self.settings.cool_down.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                b.probe_in_flight = false;
                b.snapshot.state = CircuitState::Open;
                b.snapshot.opened_at = Some(now);
                b.snapshot.success_count = 0;
                warn!(service, "Probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
        self.persist(Some(b.snapshot.clone()));
    }

    /// Give back a probe slot whose call did not say anything about the
    /// service (replayed or cached result, caller error).
    pub fn release(&self, service: &str) {
        let breaker = self.breaker(service);
        let mut b = breaker.lock().unwrap_or_else(|e| e.into_inner());
        b.probe_in_flight = false;
    }

    pub fn state(&self, service: &str) -> CircuitState {
        self.snapshot(service)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, service: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).snapshot.clone())
    }

    /// Every known breaker, sorted by service name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.lock().unwrap_or_else(|e| e.into_inner()).snapshot.clone())
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }
}
