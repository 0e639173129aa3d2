//! Resilience wrappers composed around a single tool invocation.
//!
//! Fixed order: rate limiter → circuit breaker → idempotency → retry(call)
//! → cache write-through. Cache lookups for read-only tools happen after
//! the idempotency check, before any attempt is made.

pub mod cache;
pub mod circuit_breaker;
pub mod fingerprint;
pub mod idempotency;
pub mod rate_limit;
pub mod retry;

pub use cache::{is_read_only, CacheStats, ResultCache};
pub use circuit_breaker::{
    Admission, BreakerSettings, BreakerSnapshot, BreakerStore, CircuitBreakers, CircuitState,
    InMemoryBreakerStore, JsonFileBreakerStore, StoreError,
};
pub use fingerprint::fingerprint;
pub use idempotency::{IdempotencyRecord, IdempotencyStore};
pub use rate_limit::{RateDecision, RateDimension, RateLimiter, RateLimits};
pub use retry::{RetryOutcome, RetryPolicy};

use crate::tool::{Tool, ToolDefinition, ToolContext, ToolError, ToolResult};
use futures::FutureExt;
use relay_core::{Config, ErrorKind};
use serde::Serialize;
use serde_json::{json, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a pipeline result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Executed,
    Cache,
    Idempotent,
    /// Refused by the rate limiter or an open circuit.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub result: ToolResult,
    /// Tool attempts made (0 when no attempt was needed or allowed).
    pub attempts: u32,
    pub source: ResultSource,
}

impl PipelineOutcome {
    fn rejected(result: ToolResult) -> Self {
        Self {
            result,
            attempts: 0,
            source: ResultSource::Rejected,
        }
    }
}

#[derive(Default)]
pub struct PipelineStats {
    executed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    idempotent_replays: AtomicU64,
    cache_hits: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub executed: u64,
    pub failed: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub idempotent_replays: u64,
    pub cache_hits: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            idempotent_replays: self.idempotent_replays.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

pub struct ResiliencePipeline {
    rate_limiter: RateLimiter,
    breakers: CircuitBreakers,
    idempotency: Option<IdempotencyStore>,
    cache: Option<ResultCache>,
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
    stats: PipelineStats,
}

impl ResiliencePipeline {
    /// Pipeline without idempotency or caching; add them with the `with_*` methods.
    pub fn new(rate_limiter: RateLimiter, breakers: CircuitBreakers, retry: RetryPolicy) -> Self {
        Self {
            rate_limiter,
            breakers,
            idempotency: None,
            cache: None,
            retry,
            call_timeout: None,
            stats: PipelineStats::default(),
        }
    }

    /// Build every stage from configuration. A breaker state file that
    /// cannot be opened falls back to in-memory state.
    pub fn from_config(config: &Config) -> Self {
        let settings = BreakerSettings::from(&config.breaker);
        let breakers = match &config.breaker.state_path {
            Some(path) => match JsonFileBreakerStore::open(path) {
                Ok(store) => CircuitBreakers::new(settings, Arc::new(store)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot open breaker state file, using memory");
                    CircuitBreakers::in_memory(settings)
                }
            },
            None => CircuitBreakers::in_memory(settings),
        };

        let mut pipeline = Self::new(
            RateLimiter::new(RateLimits::from(&config.rate_limit)),
            breakers,
            RetryPolicy::from(&config.retry),
        );
        if config.idempotency.enabled {
            pipeline = pipeline.with_idempotency(IdempotencyStore::from_config(&config.idempotency));
        }
        if config.cache.enabled {
            pipeline = pipeline.with_cache(ResultCache::from_config(&config.cache));
        }
        pipeline
    }

    pub fn with_idempotency(mut self, store: IdempotencyStore) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Per-attempt time limit; an attempt that exceeds it fails with `TIMEOUT`.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = Some(limit);
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    pub fn idempotency(&self) -> Option<&IdempotencyStore> {
        self.idempotency.as_ref()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one call through every stage. Never fails; refusals and tool
    /// errors come back as failure results.
    pub async fn run(
        &self,
        tool: &dyn Tool,
        def: &ToolDefinition,
        args: &Value,
        context: &ToolContext,
    ) -> PipelineOutcome {
        let name = def.name.as_str();

        if let RateDecision::Denied { dimension, limit, reset_at } =
            self.rate_limiter.check(name, def.metadata.rate_limit, context)
        {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            let result = ToolResult::failure(
                ErrorKind::RateLimited,
                format!("Rate limit of {limit} per window reached for {}", dimension.as_str()),
            )
            .with_metadata("dimension", json!(dimension))
            .with_metadata("reset_at", json!(reset_at.to_rfc3339()));
            return PipelineOutcome::rejected(result);
        }

        let service = def.service_name();
        if let Admission::Rejected { retry_after } = self.breakers.try_acquire(service) {
            self.stats.circuit_open.fetch_add(1, Ordering::Relaxed);
            let result = ToolResult::failure(
                ErrorKind::CircuitOpen,
                format!("Service '{service}' is unavailable, circuit open"),
            )
            .with_metadata("service", json!(service))
            .with_metadata("retry_after_ms", json!(retry_after.as_millis() as u64));
            return PipelineOutcome::rejected(result);
        }

        let read_only = is_read_only(def);
        let key = fingerprint(name, args, context);

        if !read_only {
            if let Some(record) = self.idempotency.as_ref().and_then(|s| s.lookup(&key)) {
                self.breakers.release(service);
                self.stats.idempotent_replays.fetch_add(1, Ordering::Relaxed);
                debug!(tool = name, result_id = %record.result_id, "Duplicate call answered from idempotency record");
                return PipelineOutcome {
                    result: record.result,
                    attempts: 0,
                    source: ResultSource::Idempotent,
                };
            }
        }

        let cache = self.cache.as_ref().filter(|_| read_only);
        if let Some(hit) = cache.and_then(|c| c.get(&key)) {
            self.breakers.release(service);
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome {
                result: hit,
                attempts: 0,
                source: ResultSource::Cache,
            };
        }

        let outcome = self
            .retry
            .run(name, move |_| self.attempt(tool, args, context))
            .await;
        self.stats.executed.fetch_add(1, Ordering::Relaxed);
        if outcome.attempts > 1 {
            self.stats
                .retries
                .fetch_add(u64::from(outcome.attempts - 1), Ordering::Relaxed);
        }

        let result = match outcome.result {
            Ok(result) => result,
            Err(e) => ToolResult::from(e),
        };

        match result.kind() {
            None => self.breakers.record_success(service),
            Some(kind) if kind.is_caller_error() => self.breakers.release(service),
            Some(_) => self.breakers.record_failure(service),
        }

        if result.success {
            if !read_only {
                if let Some(store) = &self.idempotency {
                    store.record(&key, &result);
                }
            }
            if let Some(cache) = cache {
                cache.put(&key, &result, cache.ttl_for(def));
            }
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        PipelineOutcome {
            result,
            attempts: outcome.attempts,
            source: ResultSource::Executed,
        }
    }

    /// One attempt: panics and overruns become errors.
    async fn attempt(&self, tool: &dyn Tool, args: &Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let call = AssertUnwindSafe(tool.execute(args.clone(), context)).catch_unwind();
        let caught = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(caught) => caught,
                Err(_) => return Err(ToolError::Timeout(limit)),
            },
            None => call.await,
        };
        caught.unwrap_or_else(|panic| {
            Err(ToolError::ExecutionFailed(format!(
                "tool panicked: {}",
                panic_message(panic.as_ref())
            )))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
