//! Shared wiring for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_tool_runtime::resilience::{
    BreakerSettings, CircuitBreakers, IdempotencyStore, RateLimiter, RateLimits, ResultCache, RetryPolicy,
};
use relay_tool_runtime::{
    ChainOrchestrator, PermissionFilter, ResiliencePipeline, StubTool, Tool, ToolContext, ToolDefinition,
    ToolError, ToolExecutor, ToolRegistry, ToolResult,
};

pub fn stub(name: &str, response: Value) -> Arc<StubTool> {
    Arc::new(StubTool::new(
        ToolDefinition::new(name, format!("Stub for {name}"), json!({"type": "object"})),
        response,
    ))
}

pub fn default_pipeline() -> ResiliencePipeline {
    ResiliencePipeline::new(
        RateLimiter::new(RateLimits::default()),
        CircuitBreakers::in_memory(BreakerSettings::default()),
        RetryPolicy::no_retries(),
    )
    .with_idempotency(IdempotencyStore::new(std::time::Duration::from_secs(60), 100))
    .with_cache(ResultCache::new(std::time::Duration::from_secs(60), 100))
}

pub fn executor(registry: Arc<ToolRegistry>, pipeline: ResiliencePipeline) -> ToolExecutor {
    ToolExecutor::new(registry, PermissionFilter::allow_all(), Arc::new(pipeline))
}

pub fn orchestrator(registry: Arc<ToolRegistry>) -> Arc<ChainOrchestrator> {
    Arc::new(ChainOrchestrator::new(executor(registry, default_pipeline())))
}

pub fn ctx() -> ToolContext {
    ToolContext::new("user-1", "tenant-1")
}

/// Fails with transient network errors for the first `failures` calls.
pub struct Flaky {
    pub name: &'static str,
    pub failures: u32,
    pub calls: AtomicU32,
}

impl Flaky {
    pub fn new(name: &'static str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for Flaky {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name, "Sometimes fails", json!({"type": "object"}))
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            Err(ToolError::Network(format!("connection reset on call {n}")))
        } else {
            Ok(ToolResult::ok(json!({"call": n, "input": input})))
        }
    }
}
