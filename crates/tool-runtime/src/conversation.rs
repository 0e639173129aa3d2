use crate::tool::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};

/// One item in a run's transcript, and the unit of input sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConversationMessage {
    /// User's text input
    User { text: String },
    /// Assistant's turn (may contain text and/or function calls)
    Assistant(AssistantContent),
    /// Serialized tool result, tagged with the call it answers
    ToolOutput { call_id: String, output: String },
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        ConversationMessage::User { text: text.into() }
    }

    /// Serialize `result` as the output for `call_id`.
    pub fn tool_output(call_id: impl Into<String>, result: &ToolResult) -> Self {
        let output = serde_json::to_string(result).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error_kind":"EXECUTION_ERROR","error":"unserializable result: {e}"}}"#)
        });
        ConversationMessage::ToolOutput {
            call_id: call_id.into(),
            output,
        }
    }

    fn approximate_chars(&self) -> usize {
        match self {
            ConversationMessage::User { text } => text.len(),
            ConversationMessage::Assistant(content) => {
                content.text.as_ref().map_or(0, |t| t.len())
                    + content
                        .tool_calls
                        .iter()
                        .map(|tc| tc.name.len() + tc.input.to_string().len())
                        .sum::<usize>()
            }
            ConversationMessage::ToolOutput { output, .. } => output.len(),
        }
    }
}

/// Content from the assistant that can contain mixed text and tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantContent {
    pub text: Option<String>,
    /// Calls with canonical tool names
    pub tool_calls: Vec<ToolCall>,
}

/// Transcript of one run with context window awareness.
///
/// The model side keeps its own history behind the continuation token; this
/// is the caller-visible record and is trimmed from the front when it grows
/// past `max_tokens`.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    /// Maximum approximate token count before truncation
    max_tokens: usize,
    system_prompt: Option<String>,
}

impl Conversation {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.maybe_truncate();
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ConversationMessage> {
        self.messages
    }

    /// Approximate token count using character count / 4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(ConversationMessage::approximate_chars)
            .sum::<usize>()
            / 4
    }

    /// Drop oldest messages when over the token limit.
    fn maybe_truncate(&mut self) {
        while self.approximate_tokens() > self.max_tokens && self.messages.len() > 2 {
            // Keep at least the last 2 messages (current turn)
            self.messages.remove(0);
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(100_000)
    }
}
