//! Wiring a runtime from configuration and on-disk catalog files.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use relay_core::Config;
use relay_tool_runtime::tools::{load_catalog, StubTool};
use relay_tool_runtime::{
    ChainOrchestrator, LoadToolsTool, LogTracker, ModulePolicy, PermissionFilter, PolicyOracle,
    ResiliencePipeline, SearchToolsTool, StreamEvent, Tool, ToolContext, ToolExecutor, ToolRegistry,
};

/// Registry with the discovery tools plus every catalog entry. Entries that
/// name a module are filed under it and load on demand.
pub fn load_registry(catalog: Option<&Path>) -> Result<Arc<ToolRegistry>> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(SearchToolsTool::new(registry.clone())));
    registry.register(Arc::new(LoadToolsTool::new(registry.clone())));

    let Some(path) = catalog else {
        return Ok(registry);
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read catalog {}", path.display()))?;
    let entries = load_catalog(&text).with_context(|| format!("invalid catalog {}", path.display()))?;

    let mut modules: BTreeMap<String, Vec<Arc<dyn Tool>>> = BTreeMap::new();
    let mut registered = 0;
    for entry in entries {
        match entry.module.clone() {
            Some(module) => modules.entry(module).or_default().push(Arc::new(StubTool::from(entry))),
            None => {
                registry.register(Arc::new(StubTool::from(entry)));
                registered += 1;
            }
        }
    }
    let module_count = modules.len();
    for (module, tools) in modules {
        debug!(module = %module, tools = tools.len(), "Catalog module available");
        registry.add_module(module, tools);
    }
    info!(path = %path.display(), registered, modules = module_count, "Catalog loaded");
    Ok(registry)
}

pub fn load_permissions(policy: Option<&Path>) -> Result<PermissionFilter> {
    let Some(path) = policy else {
        return Ok(PermissionFilter::allow_all());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read policy {}", path.display()))?;
    let policy: ModulePolicy =
        serde_json::from_str(&text).with_context(|| format!("invalid policy {}", path.display()))?;
    Ok(PermissionFilter::new(Arc::new(PolicyOracle::new(policy))))
}

pub fn orchestrator(config: &Config, registry: Arc<ToolRegistry>, permissions: PermissionFilter) -> ChainOrchestrator {
    let pipeline = Arc::new(ResiliencePipeline::from_config(config));
    let executor = ToolExecutor::new(registry, permissions, pipeline).with_tracker(Arc::new(LogTracker));
    ChainOrchestrator::new(executor)
        .with_max_depth(config.agent_loop.chain_max_depth)
        .with_suspension(
            Duration::from_secs(config.agent_loop.suspension_ttl_secs),
            config.agent_loop.suspension_capacity,
        )
}

/// Parse `user@tenant`; either half may be empty.
pub fn caller_context(caller: &str) -> Result<ToolContext> {
    let Some((user, tenant)) = caller.split_once('@') else {
        bail!("caller must look like user@tenant, got '{caller}'");
    };
    let mut context = ToolContext::anonymous();
    context.user_id = (!user.is_empty()).then(|| user.to_string());
    context.tenant_id = (!tenant.is_empty()).then(|| tenant.to_string());
    Ok(context)
}

pub fn load_script(path: &Path) -> Result<Vec<Vec<StreamEvent>>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid event script {}", path.display()))
}
