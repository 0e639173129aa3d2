//! Fixed-window rate limiting per tool, per user and per tenant.

use crate::tool::ToolContext;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use relay_core::config::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Which counter rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDimension {
    Tool,
    User,
    Tenant,
}

impl RateDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateDimension::Tool => "tool",
            RateDimension::User => "user",
            RateDimension::Tenant => "tenant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// Counters incremented; `remaining` is the tightest headroom left.
    Allowed { remaining: u32 },
    Denied {
        dimension: RateDimension,
        limit: u32,
        reset_at: DateTime<Utc>,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub enabled: bool,
    /// Ceilings per window; 0 disables the dimension.
    pub per_tool: u32,
    pub per_user: u32,
    pub per_tenant: u32,
    pub window: Duration,
    /// Most counters tracked at once; idle ones are evicted first.
    pub max_keys: u64,
}

impl From<&RateLimitConfig> for RateLimits {
    fn from(c: &RateLimitConfig) -> Self {
        Self {
            enabled: c.enabled,
            per_tool: c.per_tool,
            per_user: c.per_user,
            per_tenant: c.per_tenant,
            window: Duration::from_secs(c.window_secs),
            max_keys: c.max_keys,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

impl Window {
    fn new() -> Self {
        Self {
            count: 0,
            started: Instant::now(),
        }
    }

    fn roll(&mut self, window: Duration) {
        if self.started.elapsed() >= window {
            self.count = 0;
            self.started = Instant::now();
        }
    }

    fn reset_at(&self, window: Duration) -> DateTime<Utc> {
        let left = window.saturating_sub(self.started.elapsed());
        Utc::now() + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Shared limiter. Each counter key has its own lock; a check locks only the
/// keys it touches, always in sorted key order. Windows live in a bounded
/// cache and drop out one window length after they were opened.
pub struct RateLimiter {
    limits: RateLimits,
    windows: Cache<String, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        let windows = Cache::builder()
            .max_capacity(limits.max_keys)
            .time_to_live(limits.window)
            .build();
        Self { limits, windows }
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    fn window_for(&self, key: &str) -> Arc<Mutex<Window>> {
        self.windows
            .get_with(key.to_string(), || Arc::new(Mutex::new(Window::new())))
    }

    /// Check every applicable counter and, only if all are under their
    /// ceiling, increment them together. Never fails.
    ///
    /// `tool_ceiling` overrides the configured per-tool ceiling.
    pub fn check(&self, tool: &str, tool_ceiling: Option<u32>, context: &ToolContext) -> RateDecision {
        if !self.limits.enabled {
            return RateDecision::Allowed { remaining: u32::MAX };
        }

        let mut counters: Vec<(String, RateDimension, u32)> = Vec::with_capacity(3);
        counters.push((
            format!("tool:{tool}"),
            RateDimension::Tool,
            tool_ceiling.unwrap_or(self.limits.per_tool),
        ));
        if let Some(user) = &context.user_id {
            counters.push((format!("user:{user}"), RateDimension::User, self.limits.per_user));
        }
        if let Some(tenant) = &context.tenant_id {
            counters.push((format!("tenant:{tenant}"), RateDimension::Tenant, self.limits.per_tenant));
        }
        counters.retain(|(_, _, ceiling)| *ceiling > 0);
        if counters.is_empty() {
            return RateDecision::Allowed { remaining: u32::MAX };
        }

        // Fixed lock order prevents deadlocks between concurrent checks
        let mut order: Vec<usize> = (0..counters.len()).collect();
        order.sort_by(|&a, &b| counters[a].0.cmp(&counters[b].0));
        let windows: Vec<_> = order.iter().map(|&i| (i, self.window_for(&counters[i].0))).collect();
        let mut guards: Vec<_> = windows
            .iter()
            .map(|(i, w)| (*i, w.lock().unwrap_or_else(|e| e.into_inner())))
            .collect();
        // Report the first exhausted dimension in tool, user, tenant order
        guards.sort_by_key(|(i, _)| *i);

        for (i, guard) in guards.iter_mut() {
            guard.roll(self.limits.window);
            let (key, dimension, ceiling) = &counters[*i];
            if guard.count >= *ceiling {
                let reset_at = guard.reset_at(self.limits.window);
                info!(key = %key, dimension = dimension.as_str(), limit = ceiling, %reset_at, "Rate limit exceeded");
                return RateDecision::Denied {
                    dimension: *dimension,
                    limit: *ceiling,
                    reset_at,
                };
            }
        }

        let mut remaining = u32::MAX;
        for (i, guard) in guards.iter_mut() {
            guard.count += 1;
            remaining = remaining.min(counters[*i].2 - guard.count);
        }
        debug!(tool, remaining, "Rate limit check passed");
        RateDecision::Allowed { remaining }
    }

    /// Current count for a raw counter key (`tool:..`, `user:..`, `tenant:..`).
    pub fn current(&self, key: &str) -> u32 {
        self.windows
            .get(key)
            .map(|w| {
                let mut w = w.lock().unwrap_or_else(|e| e.into_inner());
                w.roll(self.limits.window);
                w.count
            })
            .unwrap_or(0)
    }

    /// Counters currently held, after expired ones are dropped.
    pub fn tracked_keys(&self) -> u64 {
        self.windows.run_pending_tasks();
        self.windows.entry_count()
    }
}
