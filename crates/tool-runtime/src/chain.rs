//! Dependency-aware execution of a tool and the prerequisites it declares.
//!
//! Planning walks the declared `dependencies` of the requested tool up to a
//! maximum depth, orders the closure with Kahn's algorithm (prerequisites
//! first, target last), and reports unregistered and cyclic tools instead
//! of failing. Execution walks the plan through the [`ToolExecutor`] and can
//! suspend mid-chain when a step asks for user input.

use crate::executor::ToolExecutor;
use crate::permission::PermissionDecision;
use crate::suspension::SuspensionStore;
use crate::tool::{ToolContext, ToolResult};
use relay_core::ErrorKind;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Execution order for one top-level tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainPlan {
    pub target: String,
    /// Registered tools in execution order; the target comes last.
    pub order: Vec<String>,
    /// Declared dependencies that are not registered, in discovery order.
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
    /// Tools that sit on a dependency cycle, sorted.
    pub cyclic: Vec<String>,
}

impl ChainPlan {
    pub fn is_executable(&self) -> bool {
        self.missing.is_empty() && self.cyclic.is_empty() && self.order.last() == Some(&self.target)
    }

    /// Tools run before the target.
    pub fn prerequisites(&self) -> &[String] {
        match self.order.split_last() {
            Some((last, rest)) if *last == self.target => rest,
            _ => &self.order,
        }
    }
}

/// One executed step of a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStep {
    pub tool: String,
    pub result: ToolResult,
}

/// Three-way result of running a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Success {
        result: ToolResult,
        steps: Vec<ChainStep>,
    },
    Failure {
        /// Tool that stopped the chain. Empty when a resume token was unknown.
        failed_tool: String,
        result: ToolResult,
    },
    /// A step needs more input from the user. Pass the token to
    /// [`ChainOrchestrator::resume`] together with that input.
    Suspended {
        resume_token: String,
        pending_tool: String,
        prompt: String,
        result: ToolResult,
    },
}

impl ChainOutcome {
    /// The result that should be reported for the requested tool.
    pub fn result(&self) -> &ToolResult {
        match self {
            ChainOutcome::Success { result, .. }
            | ChainOutcome::Failure { result, .. }
            | ChainOutcome::Suspended { result, .. } => result,
        }
    }

    pub fn into_result(self) -> ToolResult {
        match self {
            ChainOutcome::Success { result, .. }
            | ChainOutcome::Failure { result, .. }
            | ChainOutcome::Suspended { result, .. } => result,
        }
    }
}

struct SuspendedChain {
    target: String,
    /// Steps still to run, starting with the one that asked for input.
    remaining: Vec<String>,
    args: Value,
    trace_id: String,
    steps: Vec<ChainStep>,
}

pub struct ChainOrchestrator {
    executor: ToolExecutor,
    max_depth: usize,
    suspended: SuspensionStore<SuspendedChain>,
}

impl ChainOrchestrator {
    pub fn new(executor: ToolExecutor) -> Self {
        Self {
            executor,
            max_depth: DEFAULT_MAX_DEPTH,
            suspended: SuspensionStore::default(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Bound how long and how many chains stay resumable.
    pub fn with_suspension(mut self, ttl: Duration, capacity: usize) -> Self {
        self.suspended = SuspensionStore::new(ttl, capacity);
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Whether `tool` is registered and declares prerequisites.
    pub fn has_dependencies(&self, tool: &str) -> bool {
        self.executor
            .registry()
            .definition(tool)
            .is_some_and(|def| !def.dependencies.is_empty())
    }

    /// Plan `tool` with the configured depth. Adds a warning for every
    /// module in the plan the caller is not allowed to use, and when `args`
    /// would fail the target's schema.
    pub async fn plan_chain(&self, tool: &str, args: &Value, context: &ToolContext) -> ChainPlan {
        let mut plan = self.plan_with_depth(tool, self.max_depth);
        if let Some(def) = self.executor.registry().definition(tool) {
            if let Err(reason) = self.executor.validators().validate(&def, args.clone()) {
                plan.warnings.push(format!("arguments for {tool} will be rejected: {reason}"));
            }
        }
        for name in &plan.order {
            if let PermissionDecision::Denied { module } =
                self.executor.permissions().check(name, context).await
            {
                plan.warnings
                    .push(format!("caller may not use module '{module}' required by {name}"));
            }
        }
        plan
    }

    /// Pure planning over the registry.
    pub fn plan_with_depth(&self, tool: &str, max_depth: usize) -> ChainPlan {
        let registry = self.executor.registry();
        let mut plan = ChainPlan {
            target: tool.to_string(),
            ..ChainPlan::default()
        };

        // Discovery order, and for each registered node its registered deps.
        let mut nodes: Vec<String> = Vec::new();
        let mut deps_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut missing: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(tool.to_string(), 0)]);
        let mut seen: HashSet<String> = HashSet::from([tool.to_string()]);

        while let Some((name, depth)) = queue.pop_front() {
            let Some(def) = registry.definition(&name) else {
                if missing.insert(name.clone()) {
                    plan.missing.push(name);
                }
                continue;
            };
            nodes.push(name.clone());

            if !def.dependencies.is_empty() && depth >= max_depth {
                plan.warnings.push(format!(
                    "dependencies of {name} not expanded: depth limit {max_depth} reached"
                ));
                deps_of.insert(name, Vec::new());
                continue;
            }

            let mut registered = Vec::new();
            for dep in def.dependencies {
                if registry.has(&dep) {
                    registered.push(dep.clone());
                }
                if seen.insert(dep.clone()) {
                    queue.push_back((dep, depth + 1));
                }
            }
            deps_of.insert(name, registered);
        }

        for name in &plan.missing {
            plan.warnings.push(format!("dependency {name} is not registered"));
        }

        // Kahn: a node is ready once all its registered deps are ordered.
        let mut remaining: HashMap<&str, usize> = nodes
            .iter()
            .map(|n| (n.as_str(), deps_of.get(n).map_or(0, Vec::len)))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &nodes {
            for dep in deps_of.get(node).into_iter().flatten() {
                dependents.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }
        // Seed deepest-first so prerequisites discovered later run earlier.
        let mut ready: VecDeque<&str> = nodes
            .iter()
            .rev()
            .filter(|n| remaining.get(n.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();
        while let Some(node) = ready.pop_front() {
            plan.order.push(node.to_string());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if plan.order.len() < nodes.len() {
            let ordered: HashSet<&str> = plan.order.iter().map(String::as_str).collect();
            let stuck: Vec<&str> = nodes
                .iter()
                .map(String::as_str)
                .filter(|n| !ordered.contains(n))
                .collect();
            plan.cyclic = stuck
                .iter()
                .filter(|n| on_cycle(n, &deps_of, &stuck))
                .map(|n| n.to_string())
                .collect();
            plan.cyclic.sort();
            plan.warnings
                .push(format!("dependency cycle among: {}", plan.cyclic.join(", ")));
        }

        debug!(
            tool,
            order = ?plan.order,
            missing = ?plan.missing,
            cyclic = ?plan.cyclic,
            "Planned tool chain"
        );
        plan
    }

    /// Run `tool` after its prerequisites, each with the same arguments and
    /// context.
    pub async fn execute_with_dependencies(
        &self,
        tool: &str,
        args: Value,
        context: &ToolContext,
        max_depth: usize,
    ) -> ChainOutcome {
        let plan = self.plan_with_depth(tool, max_depth);

        if !self.executor.registry().has(tool) {
            let result = self.executor.execute(tool, args, context).await;
            return ChainOutcome::Failure {
                failed_tool: tool.to_string(),
                result,
            };
        }
        if let Some(first) = plan.missing.first() {
            warn!(tool, missing = ?plan.missing, "Chain has unregistered prerequisites");
            return ChainOutcome::Failure {
                failed_tool: first.clone(),
                result: ToolResult::failure(
                    ErrorKind::DependencyFailed,
                    format!("Prerequisite {first} of {tool} is not registered"),
                )
                .with_metadata("missing", json!(plan.missing)),
            };
        }
        if !plan.cyclic.is_empty() {
            warn!(tool, cyclic = ?plan.cyclic, "Chain has a dependency cycle");
            return ChainOutcome::Failure {
                failed_tool: plan.cyclic[0].clone(),
                result: ToolResult::failure(
                    ErrorKind::DependencyFailed,
                    format!("Dependency cycle among {}", plan.cyclic.join(", ")),
                )
                .with_metadata("cyclic", json!(plan.cyclic)),
            };
        }

        info!(tool, steps = plan.order.len(), trace_id = %context.trace_id, "Executing tool chain");
        self.walk(tool.to_string(), plan.order, args, context, Vec::new()).await
    }

    /// Continue a suspended chain. `input` is merged into the arguments of
    /// the step that asked for it (non-object input lands under `"input"`).
    pub async fn resume(&self, resume_token: &str, input: Value, context: &ToolContext) -> ChainOutcome {
        let Some(chain) = self.suspended.take(resume_token) else {
            return ChainOutcome::Failure {
                failed_tool: String::new(),
                result: ToolResult::failure(
                    ErrorKind::NotFound,
                    format!("Unknown or expired resume token: {resume_token}"),
                ),
            };
        };

        let args = merge_input(chain.args, input);
        let context = context.clone().with_trace_id(chain.trace_id);
        info!(tool = %chain.target, pending = ?chain.remaining.first(), "Resuming tool chain");
        self.walk(chain.target, chain.remaining, args, &context, chain.steps)
            .await
    }

    /// Number of chains waiting for user input that have not expired.
    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    async fn walk(
        &self,
        target: String,
        order: Vec<String>,
        args: Value,
        context: &ToolContext,
        mut steps: Vec<ChainStep>,
    ) -> ChainOutcome {
        for (index, name) in order.iter().enumerate() {
            let result = self.executor.execute(name, args.clone(), context).await;

            if let Some(prompt) = result.needs_input.clone() {
                let resume_token = format!("chain-{}", uuid::Uuid::new_v4().simple());
                info!(tool = %target, pending_tool = %name, "Chain suspended for user input");
                self.suspended.park(
                    resume_token.clone(),
                    SuspendedChain {
                        target,
                        remaining: order[index..].to_vec(),
                        args,
                        trace_id: context.trace_id.clone(),
                        steps,
                    },
                );
                return ChainOutcome::Suspended {
                    resume_token,
                    pending_tool: name.clone(),
                    prompt,
                    result,
                };
            }

            if !result.success {
                if *name == target {
                    return ChainOutcome::Failure {
                        failed_tool: target,
                        result,
                    };
                }
                let cause = result.kind().unwrap_or(ErrorKind::ExecutionError);
                warn!(tool = %target, prerequisite = %name, cause = %cause, "Prerequisite failed");
                let message = result.error.clone().unwrap_or_default();
                return ChainOutcome::Failure {
                    failed_tool: name.clone(),
                    result: ToolResult::failure(
                        ErrorKind::DependencyFailed,
                        format!("Prerequisite {name} failed: {message}"),
                    )
                    .with_metadata("prerequisite", json!(name))
                    .with_metadata("cause", json!(cause)),
                };
            }

            if *name == target {
                return ChainOutcome::Success { result, steps };
            }
            steps.push(ChainStep {
                tool: name.clone(),
                result,
            });
        }

        // Unreachable for executable plans; the target is always last.
        ChainOutcome::Failure {
            failed_tool: target.clone(),
            result: ToolResult::failure(
                ErrorKind::DependencyFailed,
                format!("Chain for {target} ended before the target ran"),
            ),
        }
    }
}

fn on_cycle(start: &str, deps_of: &HashMap<String, Vec<String>>, within: &[&str]) -> bool {
    let mut stack: Vec<&str> = deps_of
        .get(start)
        .map(|d| d.iter().map(String::as_str).collect())
        .unwrap_or_default();
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == start {
            return true;
        }
        if !within.contains(&node) || !visited.insert(node) {
            continue;
        }
        if let Some(next) = deps_of.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    false
}

fn merge_input(args: Value, input: Value) -> Value {
    let mut merged = match args {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    match input {
        Value::Object(extra) => merged.extend(extra),
        Value::Null => {}
        other => {
            merged.insert("input".to_string(), other);
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionFilter;
    use crate::registry::ToolRegistry;
    use crate::resilience::{BreakerSettings, CircuitBreakers, RateLimiter, RateLimits, ResiliencePipeline, RetryPolicy};
    use crate::tool::{Tool, ToolDefinition, ToolError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Step {
        name: &'static str,
        deps: Vec<&'static str>,
        calls: AtomicU32,
        behavior: Behavior,
    }

    enum Behavior {
        Ok,
        Fail,
        AskOnce(&'static str),
    }

    impl Step {
        fn new(name: &'static str, deps: Vec<&'static str>, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name,
                deps,
                calls: AtomicU32::new(0),
                behavior,
            })
        }
    }

    #[async_trait]
    impl Tool for Step {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(self.name, "", json!({"type": "object"}))
                .with_dependencies(self.deps.clone())
        }

        async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Ok => Ok(ToolResult::ok(json!({"ran": self.name, "args": input}))),
                Behavior::Fail => Err(ToolError::ExecutionFailed("backend said no".into())),
                Behavior::AskOnce(key) => {
                    if input.get(*key).is_some() {
                        Ok(ToolResult::ok(json!({"ran": self.name, "args": input})))
                    } else {
                        Ok(ToolResult::needs_input(format!("Which {key}?"), json!({"choices": [1, 2]})))
                    }
                }
            }
        }
    }

    fn orchestrator(tools: Vec<Arc<Step>>) -> ChainOrchestrator {
        let registry = Arc::new(ToolRegistry::new());
        for tool in tools {
            registry.register(tool);
        }
        let pipeline = ResiliencePipeline::new(
            RateLimiter::new(RateLimits::default()),
            CircuitBreakers::in_memory(BreakerSettings::default()),
            RetryPolicy::no_retries(),
        );
        ChainOrchestrator::new(ToolExecutor::new(registry, PermissionFilter::allow_all(), Arc::new(pipeline)))
    }

    #[test]
    fn missing_dependency_is_reported_not_fatal() {
        let orch = orchestrator(vec![
            Step::new("crm.report", vec!["crm.auth", "crm.export"], Behavior::Ok),
            Step::new("crm.auth", vec![], Behavior::Ok),
        ]);
        let plan = orch.plan_with_depth("crm.report", 5);
        assert_eq!(plan.missing, vec!["crm.export".to_string()]);
        assert_eq!(plan.order, vec!["crm.auth".to_string(), "crm.report".to_string()]);
        assert!(!plan.is_executable());
        assert!(plan.warnings.iter().any(|w| w.contains("crm.export")));
    }

    #[test]
    fn transitive_order_puts_prerequisites_first() {
        let orch = orchestrator(vec![
            Step::new("deals.close", vec!["deals.price", "crm.auth"], Behavior::Ok),
            Step::new("deals.price", vec!["crm.auth"], Behavior::Ok),
            Step::new("crm.auth", vec![], Behavior::Ok),
        ]);
        let plan = orch.plan_with_depth("deals.close", 5);
        assert!(plan.is_executable());
        assert_eq!(plan.order, vec!["crm.auth", "deals.price", "deals.close"]);
        assert_eq!(plan.prerequisites(), ["crm.auth".to_string(), "deals.price".to_string()]);
    }

    #[test]
    fn cycles_are_flagged() {
        let orch = orchestrator(vec![
            Step::new("a.top", vec!["a.x"], Behavior::Ok),
            Step::new("a.x", vec!["a.y"], Behavior::Ok),
            Step::new("a.y", vec!["a.x"], Behavior::Ok),
        ]);
        let plan = orch.plan_with_depth("a.top", 5);
        assert_eq!(plan.cyclic, vec!["a.x".to_string(), "a.y".to_string()]);
        assert!(plan.order.is_empty());
        assert!(plan.warnings.iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn depth_limit_stops_expansion() {
        let orch = orchestrator(vec![
            Step::new("l.zero", vec!["l.one"], Behavior::Ok),
            Step::new("l.one", vec!["l.two"], Behavior::Ok),
            Step::new("l.two", vec![], Behavior::Ok),
        ]);
        let plan = orch.plan_with_depth("l.zero", 1);
        assert_eq!(plan.order, vec!["l.one", "l.zero"]);
        assert!(plan.warnings.iter().any(|w| w.contains("depth limit")));
    }

    #[tokio::test]
    async fn runs_prerequisites_then_target() {
        let auth = Step::new("crm.auth", vec![], Behavior::Ok);
        let orch = orchestrator(vec![
            Step::new("crm.report", vec!["crm.auth"], Behavior::Ok),
            auth.clone(),
        ]);
        let outcome = orch
            .execute_with_dependencies("crm.report", json!({"q": 1}), &ToolContext::anonymous(), 5)
            .await;
        match outcome {
            ChainOutcome::Success { result, steps } => {
                assert_eq!(result.data.unwrap()["ran"], "crm.report");
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].result.data.as_ref().unwrap()["args"]["q"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_prerequisite_is_dependency_failed() {
        let target = Step::new("crm.report", vec!["crm.auth"], Behavior::Ok);
        let orch = orchestrator(vec![target.clone(), Step::new("crm.auth", vec![], Behavior::Fail)]);
        let outcome = orch
            .execute_with_dependencies("crm.report", json!({}), &ToolContext::anonymous(), 5)
            .await;
        match outcome {
            ChainOutcome::Failure { failed_tool, result } => {
                assert_eq!(failed_tool, "crm.auth");
                assert_eq!(result.kind(), Some(ErrorKind::DependencyFailed));
                assert_eq!(result.metadata["cause"], "EXECUTION_ERROR");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_prerequisite_fails_before_running() {
        let target = Step::new("crm.report", vec!["crm.export"], Behavior::Ok);
        let orch = orchestrator(vec![target.clone()]);
        let outcome = orch
            .execute_with_dependencies("crm.report", json!({}), &ToolContext::anonymous(), 5)
            .await;
        assert_eq!(outcome.result().kind(), Some(ErrorKind::DependencyFailed));
        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn suspends_and_resumes() {
        let auth = Step::new("crm.auth", vec![], Behavior::Ok);
        let pick = Step::new("crm.pick_account", vec!["crm.auth"], Behavior::AskOnce("account"));
        let orch = orchestrator(vec![
            Step::new("crm.report", vec!["crm.pick_account"], Behavior::Ok),
            pick.clone(),
            auth.clone(),
        ]);
        let ctx = ToolContext::new("u1", "t1");

        let outcome = orch
            .execute_with_dependencies("crm.report", json!({"period": "q3"}), &ctx, 5)
            .await;
        let (resume_token, pending_tool, prompt) = match outcome {
            ChainOutcome::Suspended { resume_token, pending_tool, prompt, .. } => {
                (resume_token, pending_tool, prompt)
            }
            other => panic!("expected suspension, got {other:?}"),
        };
        assert_eq!(pending_tool, "crm.pick_account");
        assert_eq!(prompt, "Which account?");
        assert_eq!(orch.suspended_count(), 1);

        let resumed = orch
            .resume(&resume_token, json!({"account": 2}), &ToolContext::new("u1", "t1"))
            .await;
        match resumed {
            ChainOutcome::Success { result, steps } => {
                let args = &result.data.unwrap()["args"];
                assert_eq!(args["period"], "q3");
                assert_eq!(args["account"], 2);
                assert_eq!(steps.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pick.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.suspended_count(), 0);
    }

    #[tokio::test]
    async fn unknown_resume_token() {
        let orch = orchestrator(vec![]);
        let outcome = orch.resume("chain-nope", json!({}), &ToolContext::anonymous()).await;
        assert_eq!(outcome.result().kind(), Some(ErrorKind::NotFound));
    }

    #[test]
    fn merge_wraps_scalars() {
        assert_eq!(merge_input(json!({"a": 1}), json!("yes")), json!({"a": 1, "input": "yes"}));
        assert_eq!(merge_input(Value::Null, json!({"b": 2})), json!({"b": 2}));
    }
}
