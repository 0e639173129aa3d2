use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError, ToolResult};

/// Returns its `message` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "Echoes back the input message",
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Message to echo" }
                },
                "required": ["message"]
            }),
        )
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".into()))?;
        Ok(ToolResult::ok(json!(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let result = EchoTool
            .execute(json!({"message": "hello"}), &ToolContext::anonymous())
            .await
            .unwrap();
        assert_eq!(result.data, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_echo_missing_message() {
        let err = EchoTool.execute(json!({}), &ToolContext::anonymous()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
