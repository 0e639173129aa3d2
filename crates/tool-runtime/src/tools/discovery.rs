//! Catalog browsing for runs that start with a small tool set.
//!
//! Both tools are flagged `discovery` so autonomous runs that preload what
//! they need can hide them.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::registry::{RegistryError, ToolRegistry};
use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError, ToolMetadata, ToolResult};

fn discovery_metadata(read_only: bool) -> ToolMetadata {
    ToolMetadata {
        read_only: Some(read_only),
        // Catalog state changes as modules load; never serve a stale answer.
        cache_ttl_secs: read_only.then_some(0),
        discovery: true,
        ..ToolMetadata::default()
    }
}

/// Search the module catalog by keyword.
pub struct SearchToolsTool {
    registry: Arc<ToolRegistry>,
}

impl SearchToolsTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for SearchToolsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "search_tools",
            "Search available tool modules by keyword. Returns matching tools and the module that provides them.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Keyword to match against names and descriptions" }
                },
                "required": ["query"]
            }),
        )
        .with_metadata(discovery_metadata(true))
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'query' field".into()))?;

        let matches: Vec<Value> = self
            .registry
            .search(query)
            .into_iter()
            .map(|(module, def)| {
                json!({
                    "module": module,
                    "name": def.name,
                    "description": def.description,
                    "loaded": self.registry.has(&def.name),
                })
            })
            .collect();
        let hits = matches.len();
        debug!(query, hits, "Tool catalog search");

        Ok(ToolResult::ok(json!({ "query": query, "matches": matches }))
            .with_metadata("message", json!(format!("{hits} matching tool(s)"))))
    }
}

/// Load a catalog module so its tools become callable.
pub struct LoadToolsTool {
    registry: Arc<ToolRegistry>,
}

impl LoadToolsTool {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for LoadToolsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "load_tools",
            "Load a tool module so its tools can be called on the next turn.",
            json!({
                "type": "object",
                "properties": {
                    "module": { "type": "string", "description": "Module name from search_tools" }
                },
                "required": ["module"]
            }),
        )
        .with_metadata(discovery_metadata(false))
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let module = input
            .get("module")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'module' field".into()))?;

        let added = self.registry.load_module(module).map_err(|e| match e {
            RegistryError::UnknownModule(_) => ToolError::InvalidInput(e.to_string()),
        })?;
        let names: Vec<&str> = added.iter().map(|d| d.name.as_str()).collect();

        Ok(ToolResult::ok(json!({ "module": module, "added": names })))
    }
}
