use async_trait::async_trait;
use relay_core::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Optional capability flags a tool declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Explicit read-only declaration. When unset, the name is inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Per-tool result cache TTL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    /// Per-tool rate ceiling override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// Backend service the tool talks to; tools sharing a service share a breaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Generic "find more tools" capability, hidden from autonomous runs.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discovery: bool,
}

/// Describes a tool's interface for LLM consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Canonical dotted name (e.g., "projects.list")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
    /// Canonical names of tools that must run before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: ToolMetadata,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            dependencies: Vec::new(),
            metadata: ToolMetadata::default(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: ToolMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// First namespace segment of the canonical name, if any.
    pub fn module(&self) -> Option<&str> {
        module_of(&self.name)
    }

    /// Circuit-breaker key: declared service, else owning module, else the tool itself.
    pub fn service_name(&self) -> &str {
        self.metadata
            .service
            .as_deref()
            .or_else(|| self.module())
            .unwrap_or(&self.name)
    }
}

/// Where a canonical name sits in the module namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScope<'a> {
    /// No `.` at all: a core tool outside every module.
    Unscoped,
    /// Everything before the first `.`.
    Module(&'a str),
    /// Dotted, but with an empty segment (`.admin`, `crm.`, `crm..list`).
    Malformed,
}

pub fn scope_of(name: &str) -> NameScope<'_> {
    if !name.contains('.') {
        return NameScope::Unscoped;
    }
    if name.split('.').any(str::is_empty) {
        return NameScope::Malformed;
    }
    match name.split_once('.') {
        Some((module, _)) => NameScope::Module(module),
        None => NameScope::Unscoped,
    }
}

/// Owning module of a well-formed canonical tool name.
pub fn module_of(name: &str) -> Option<&str> {
    match scope_of(name) {
        NameScope::Module(module) => Some(module),
        NameScope::Unscoped | NameScope::Malformed => None,
    }
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-issued ID for this invocation (used to match results)
    pub id: String,
    /// Canonical tool name to execute
    pub name: String,
    /// JSON input arguments
    pub input: Value,
}

/// Acting identity and correlation id for a call.
///
/// The trace id stays the same for every tool executed within one chain or
/// run so resilience state and external audit records can be joined on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub trace_id: String,
}

impl ToolContext {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            tenant_id: Some(tenant_id.into()),
            trace_id: new_trace_id(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            tenant_id: None,
            trace_id: new_trace_id(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

fn new_trace_id() -> String {
    format!("tr-{}", uuid::Uuid::new_v4().simple())
}

/// Outcome of a tool execution, sent back to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    /// Payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form extras (e.g. a user-facing message)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Set when the tool cannot proceed without further user input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_input: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error_kind: None,
            error: None,
            metadata: Map::new(),
            needs_input: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_kind: Some(kind),
            error: Some(message.into()),
            metadata: Map::new(),
            needs_input: None,
        }
    }

    /// A successful partial result that asks the user for more information.
    pub fn needs_input(prompt: impl Into<String>, data: Value) -> Self {
        Self {
            needs_input: Some(prompt.into()),
            ..Self::ok(data)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Failure kind, `EXECUTION_ERROR` for failures that did not set one.
    pub fn kind(&self) -> Option<ErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ErrorKind::ExecutionError))
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(e: ToolError) -> Self {
        ToolResult::failure(e.kind(), e.to_string())
    }
}

/// The primary extension point: all tools implement this trait.
///
/// Tools are object-safe, Send + Sync, and async.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timeout after {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::InvalidInput(_) => ErrorKind::Validation,
            ToolError::PermissionDenied(_) => ErrorKind::AccessDenied,
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::RateLimited { .. } => ErrorKind::RateLimited,
            ToolError::ExecutionFailed(_)
            | ToolError::Network(_)
            | ToolError::Upstream { .. }
            | ToolError::Transient(_)
            | ToolError::Other(_) => ErrorKind::ExecutionError,
        }
    }

    /// Network, timeout, rate-limited, upstream 5xx and transient failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Network(_)
            | ToolError::Timeout(_)
            | ToolError::RateLimited { .. }
            | ToolError::Transient(_) => true,
            ToolError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ToolError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_definition_serialization() {
        let def = ToolDefinition::new("projects.list", "List projects", serde_json::json!({"type": "object"}))
            .with_dependencies(["auth.session"]);
        let json = serde_json::to_string(&def).unwrap();
        let roundtrip: ToolDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip.name, "projects.list");
        assert_eq!(roundtrip.dependencies, vec!["auth.session".to_string()]);
        assert_eq!(roundtrip.metadata, ToolMetadata::default());
    }

    #[test]
    fn test_minimal_definition_deserializes() {
        let def: ToolDefinition = serde_json::from_str(
            r#"{"name": "echo", "description": "Echo", "input_schema": {"type": "object"}}"#,
        )
        .unwrap();
        assert!(def.dependencies.is_empty());
        assert!(def.metadata.read_only.is_none());
    }

    #[test]
    fn test_module_and_service() {
        let def = ToolDefinition::new("crm.contacts.find", "", Value::Null);
        assert_eq!(def.module(), Some("crm"));
        assert_eq!(def.service_name(), "crm");

        let echo = ToolDefinition::new("echo", "", Value::Null);
        assert_eq!(echo.module(), None);
        assert_eq!(echo.service_name(), "echo");

        let billing = ToolDefinition::new("invoices.create", "", Value::Null).with_metadata(ToolMetadata {
            service: Some("stripe".into()),
            ..Default::default()
        });
        assert_eq!(billing.service_name(), "stripe");

        assert_eq!(module_of(".hidden"), None);
        assert_eq!(module_of("trailing."), None);
        assert_eq!(scope_of("echo"), NameScope::Unscoped);
        assert_eq!(scope_of("crm.contacts.find"), NameScope::Module("crm"));
        assert_eq!(scope_of(".admin"), NameScope::Malformed);
        assert_eq!(scope_of("crm..list"), NameScope::Malformed);
    }

    #[test]
    fn test_tool_result_serialization() {
        let result = ToolResult::ok(serde_json::json!([1, 2, 3])).with_metadata("message", "3 projects".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("error_kind").is_none());

        let failure = ToolResult::failure(ErrorKind::NotFound, "Unknown tool: x");
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["error_kind"], "NOT_FOUND");
        let roundtrip: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip, failure);
    }

    #[test]
    fn test_error_classification() {
        assert!(ToolError::Network("reset".into()).is_retryable());
        assert!(ToolError::Upstream { status: 503, message: "unavailable".into() }.is_retryable());
        assert!(!ToolError::Upstream { status: 404, message: "missing".into() }.is_retryable());
        assert!(!ToolError::InvalidInput("bad".into()).is_retryable());
        assert!(!ToolError::PermissionDenied("no".into()).is_retryable());
        assert_eq!(ToolError::InvalidInput("bad".into()).kind(), ErrorKind::Validation);
        assert_eq!(ToolError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Timeout);

        let result: ToolResult = ToolError::ExecutionFailed("boom".into()).into();
        assert!(!result.success);
        assert_eq!(result.kind(), Some(ErrorKind::ExecutionError));
    }
}
