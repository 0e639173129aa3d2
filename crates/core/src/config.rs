use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// Parse a profiled env var, warning and falling back to `default` on bad input.
fn profiled_env_parse<T: FromStr + Copy>(profile: &str, key: &str, default: T) -> T {
    match profiled_env_opt(profile, key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid config value, using default");
            default
        }),
        None => default,
    }
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!(key, value = %raw, "Invalid boolean config value, using default");
                default
            }
        },
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub cache: CacheConfig,
    pub agent_loop: LoopConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `RELAY_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("RELAY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            breaker: BreakerConfig::from_env_profiled(p),
            rate_limit: RateLimitConfig::from_env_profiled(p),
            retry: RetryConfig::from_env_profiled(p),
            idempotency: IdempotencyConfig::from_env_profiled(p),
            cache: CacheConfig::from_env_profiled(p),
            agent_loop: LoopConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  breaker:     failures={}, successes={}, cool_down={}s",
            self.breaker.failure_threshold,
            self.breaker.success_threshold,
            self.breaker.cool_down_secs
        );
        tracing::info!(
            "  rate_limit:  enabled={}, tool={}, user={}, tenant={}, window={}s",
            self.rate_limit.enabled,
            self.rate_limit.per_tool,
            self.rate_limit.per_user,
            self.rate_limit.per_tenant,
            self.rate_limit.window_secs
        );
        tracing::info!(
            "  retry:       attempts={}, backoff={}",
            self.retry.max_attempts,
            self.retry.backoff
        );
        tracing::info!(
            "  cache:       enabled={}, ttl={}s",
            self.cache.enabled,
            self.cache.default_ttl_secs
        );
        tracing::info!(
            "  loop:        iterations={}, continuations={}, suppress_discovery={}",
            self.agent_loop.max_iterations,
            self.agent_loop.max_continuations,
            self.agent_loop.suppress_discovery
        );
    }

    /// Return a redacted view safe for printing (no filesystem paths).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "breaker": {
                "failure_threshold": self.breaker.failure_threshold,
                "success_threshold": self.breaker.success_threshold,
                "cool_down_secs": self.breaker.cool_down_secs,
                "persistent": self.breaker.state_path.is_some(),
            },
            "rate_limit": {
                "enabled": self.rate_limit.enabled,
                "per_tool": self.rate_limit.per_tool,
                "per_user": self.rate_limit.per_user,
                "per_tenant": self.rate_limit.per_tenant,
                "window_secs": self.rate_limit.window_secs,
                "max_keys": self.rate_limit.max_keys,
            },
            "retry": {
                "max_attempts": self.retry.max_attempts,
                "backoff": self.retry.backoff.as_str(),
                "initial_delay_ms": self.retry.initial_delay_ms,
                "max_delay_ms": self.retry.max_delay_ms,
            },
            "idempotency": {
                "enabled": self.idempotency.enabled,
                "window_secs": self.idempotency.window_secs,
            },
            "cache": {
                "enabled": self.cache.enabled,
                "default_ttl_secs": self.cache.default_ttl_secs,
                "capacity": self.cache.capacity,
            },
            "loop": {
                "max_iterations": self.agent_loop.max_iterations,
                "max_continuations": self.agent_loop.max_continuations,
                "suppress_discovery": self.agent_loop.suppress_discovery,
                "chain_max_depth": self.agent_loop.chain_max_depth,
                "suspension_ttl_secs": self.agent_loop.suspension_ttl_secs,
                "suspension_capacity": self.agent_loop.suspension_capacity,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: String::new(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            cache: CacheConfig::default(),
            agent_loop: LoopConfig::default(),
        }
    }
}

// ── Circuit breaker ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cool_down_secs: u64,
    /// JSON file the breaker states are persisted to. In-memory when unset.
    pub state_path: Option<PathBuf>,
}

impl BreakerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            failure_threshold: profiled_env_parse(p, "BREAKER_FAILURE_THRESHOLD", d.failure_threshold),
            success_threshold: profiled_env_parse(p, "BREAKER_SUCCESS_THRESHOLD", d.success_threshold),
            cool_down_secs: profiled_env_parse(p, "BREAKER_COOL_DOWN_SECS", d.cool_down_secs),
            state_path: profiled_env_opt(p, "BREAKER_STATE_PATH").map(PathBuf::from),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down_secs: 30,
            state_path: None,
        }
    }
}

// ── Rate limiting ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_tool: u32,
    pub per_user: u32,
    pub per_tenant: u32,
    pub window_secs: u64,
    /// Most counters tracked at once across all dimensions.
    pub max_keys: u64,
}

impl RateLimitConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(p, "RATE_LIMIT_ENABLED", d.enabled),
            per_tool: profiled_env_parse(p, "RATE_LIMIT_PER_TOOL", d.per_tool),
            per_user: profiled_env_parse(p, "RATE_LIMIT_PER_USER", d.per_user),
            per_tenant: profiled_env_parse(p, "RATE_LIMIT_PER_TENANT", d.per_tenant),
            window_secs: profiled_env_parse(p, "RATE_LIMIT_WINDOW_SECS", d.window_secs),
            max_keys: profiled_env_parse(p, "RATE_LIMIT_MAX_KEYS", d.max_keys),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_tool: 120,
            per_user: 60,
            per_tenant: 600,
            window_secs: 60,
            max_keys: 100_000,
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Fixed => "fixed",
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
            "linear" => Ok(BackoffStrategy::Linear),
            "fixed" | "constant" => Ok(BackoffStrategy::Fixed),
            other => Err(CoreError::InvalidConfig {
                key: "RETRY_BACKOFF".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl RetryConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        let backoff = match profiled_env_opt(p, "RETRY_BACKOFF") {
            Some(raw) => raw.parse().unwrap_or_else(|e: CoreError| {
                tracing::warn!(error = %e, "Unknown backoff strategy, using exponential");
                d.backoff
            }),
            None => d.backoff,
        };
        Self {
            max_attempts: profiled_env_parse(p, "RETRY_MAX_ATTEMPTS", d.max_attempts),
            backoff,
            initial_delay_ms: profiled_env_parse(p, "RETRY_INITIAL_DELAY_MS", d.initial_delay_ms),
            max_delay_ms: profiled_env_parse(p, "RETRY_MAX_DELAY_MS", d.max_delay_ms),
            multiplier: profiled_env_parse(p, "RETRY_MULTIPLIER", d.multiplier),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

// ── Idempotency ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub capacity: usize,
}

impl IdempotencyConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(p, "IDEMPOTENCY_ENABLED", d.enabled),
            window_secs: profiled_env_parse(p, "IDEMPOTENCY_WINDOW_SECS", d.window_secs),
            capacity: profiled_env_parse(p, "IDEMPOTENCY_CAPACITY", d.capacity),
        }
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 24 * 60 * 60,
            capacity: 10_000,
        }
    }
}

// ── Result cache ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    pub capacity: usize,
}

impl CacheConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(p, "TOOL_CACHE_ENABLED", d.enabled),
            default_ttl_secs: profiled_env_parse(p, "TOOL_CACHE_TTL_SECS", d.default_ttl_secs),
            capacity: profiled_env_parse(p, "TOOL_CACHE_CAPACITY", d.capacity),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 60 * 60,
            capacity: 1_000,
        }
    }
}

// ── Agentic loop ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: usize,
    /// How many times a truncated turn is resumed automatically.
    pub max_continuations: usize,
    /// Hide "search for tools" style capabilities from autonomous runs.
    pub suppress_discovery: bool,
    pub chain_max_depth: usize,
    /// How long a suspended chain or an unsent batch of tool outputs
    /// stays resumable.
    pub suspension_ttl_secs: u64,
    /// Most suspended runs kept at once; the least recently parked go first.
    pub suspension_capacity: usize,
}

impl LoopConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_iterations: profiled_env_parse(p, "LOOP_MAX_ITERATIONS", d.max_iterations),
            max_continuations: profiled_env_parse(p, "LOOP_MAX_CONTINUATIONS", d.max_continuations),
            suppress_discovery: profiled_env_bool(p, "LOOP_SUPPRESS_DISCOVERY", d.suppress_discovery),
            chain_max_depth: profiled_env_parse(p, "CHAIN_MAX_DEPTH", d.chain_max_depth),
            suspension_ttl_secs: profiled_env_parse(p, "LOOP_SUSPENSION_TTL_SECS", d.suspension_ttl_secs),
            suspension_capacity: profiled_env_parse(p, "LOOP_SUSPENSION_CAPACITY", d.suspension_capacity),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_continuations: 3,
            suppress_discovery: false,
            chain_max_depth: 5,
            suspension_ttl_secs: 60 * 60,
            suspension_capacity: 1_024,
        }
    }
}
