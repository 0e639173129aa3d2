use crate::permission::{PermissionDecision, PermissionFilter};
use crate::registry::ToolRegistry;
use crate::resilience::{PipelineOutcome, ResiliencePipeline};
use crate::schema::SchemaValidators;
use crate::tool::{ToolContext, ToolResult};
use crate::tracker::{memory_delta, ExecutionRecord, ExecutionTracker, MemoryProbe};
use relay_core::ErrorKind;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Single entry point for running one tool by name.
///
/// Resolve → permission → validation → resilience pipeline → tool. Every
/// failure along the way comes back as a [`ToolResult`]; nothing is
/// propagated to the caller.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    permissions: PermissionFilter,
    pipeline: Arc<ResiliencePipeline>,
    tracker: Option<Arc<dyn ExecutionTracker>>,
    memory: Arc<MemoryProbe>,
    validators: Arc<SchemaValidators>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        permissions: PermissionFilter,
        pipeline: Arc<ResiliencePipeline>,
    ) -> Self {
        Self {
            registry,
            permissions,
            pipeline,
            tracker: None,
            memory: Arc::new(MemoryProbe::new()),
            validators: Arc::new(SchemaValidators::new()),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExecutionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionFilter {
        &self.permissions
    }

    pub fn pipeline(&self) -> &Arc<ResiliencePipeline> {
        &self.pipeline
    }

    pub fn validators(&self) -> &SchemaValidators {
        &self.validators
    }

    /// Execute `name` with `arguments` on behalf of `context`.
    pub async fn execute(&self, name: &str, arguments: Value, context: &ToolContext) -> ToolResult {
        let started = Instant::now();
        let memory_before = self.tracker.as_ref().and_then(|_| self.memory.resident_bytes());

        let result = self.run(name, arguments, context).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            tool = name,
            trace_id = %context.trace_id,
            elapsed_ms,
            success = result.success,
            "Tool call finished"
        );

        if let Some(tracker) = &self.tracker {
            let record = ExecutionRecord {
                tool: name.to_string(),
                user_id: context.user_id.clone(),
                tenant_id: context.tenant_id.clone(),
                trace_id: context.trace_id.clone(),
                duration_ms: elapsed_ms,
                memory_delta_bytes: memory_delta(memory_before, self.memory.resident_bytes()),
                success: result.success,
                error_kind: result.kind(),
            };
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.record(record).await;
            });
        }

        result
    }

    async fn run(&self, name: &str, arguments: Value, context: &ToolContext) -> ToolResult {
        let Some(tool) = self.registry.get(name) else {
            debug!(tool = name, "Tool not registered");
            return ToolResult::failure(ErrorKind::NotFound, format!("Unknown tool: {name}"));
        };

        if let PermissionDecision::Denied { module } = self.permissions.check(name, context).await {
            return ToolResult::failure(
                ErrorKind::AccessDenied,
                format!("Access to module '{module}' denied"),
            )
            .with_metadata("module", json!(module));
        }

        let def = tool.definition();
        let arguments = match self.validators.validate(&def, arguments) {
            Ok(args) => args,
            Err(message) => return ToolResult::failure(ErrorKind::Validation, message),
        };

        let PipelineOutcome { result, attempts, source } =
            self.pipeline.run(tool.as_ref(), &def, &arguments, context).await;
        debug!(tool = name, attempts, source = ?source, "Pipeline finished");
        result
    }
}
