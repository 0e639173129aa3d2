//! Catalog-driven stand-ins for real tools.
//!
//! A catalog is a JSON array of tool definitions, each optionally carrying
//! the payload the stub answers with and the module it belongs to:
//!
//! ```json
//! [{"name": "projects.list", "description": "List projects",
//!   "input_schema": {"type": "object"}, "module": "projects",
//!   "response": [{"id": 1}, {"id": 2}, {"id": 3}]}]
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub definition: ToolDefinition,
    /// Payload returned on every call.
    #[serde(default)]
    pub response: Value,
    /// Prompt returned until the arguments carry an `answer`.
    #[serde(default)]
    pub needs_input: Option<String>,
    /// Catalog module to file the tool under instead of registering it.
    #[serde(default)]
    pub module: Option<String>,
}

pub fn load_catalog(json: &str) -> Result<Vec<CatalogEntry>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Answers every call with a fixed payload and counts calls.
pub struct StubTool {
    definition: ToolDefinition,
    response: Value,
    needs_input: Option<String>,
    calls: AtomicU32,
}

impl StubTool {
    pub fn new(definition: ToolDefinition, response: Value) -> Self {
        Self {
            definition,
            response,
            needs_input: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn asking(mut self, prompt: impl Into<String>) -> Self {
        self.needs_input = Some(prompt.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl From<CatalogEntry> for StubTool {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            definition: entry.definition,
            response: entry.response,
            needs_input: entry.needs_input,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Tool for StubTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answered = input.get("answer").is_some();
        match &self.needs_input {
            Some(prompt) if !answered => Ok(ToolResult::needs_input(prompt.clone(), self.response.clone())),
            _ => Ok(ToolResult::ok(self.response.clone())),
        }
    }
}
