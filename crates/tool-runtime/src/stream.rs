use serde::{Deserialize, Serialize};

/// Events emitted while the model streams one turn.
/// Provider-agnostic: transports translate their wire format into these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The model accepted the request; `turn_id` continues this turn later.
    TurnStarted { turn_id: String },
    /// A chunk of assistant text
    TextDelta { text: String },
    /// Start of a function call (the model wants to run a tool)
    FunctionCallStarted { call_id: String, name: String },
    /// Incremental JSON argument text for a call
    FunctionCallArgumentDelta { call_id: String, delta: String },
    /// Arguments for a call are complete. Some transports repeat the full
    /// argument text here; when present it wins over the deltas.
    FunctionCallArgumentDone {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    /// The turn stopped because the output budget ran out.
    TurnTruncated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },
    /// The turn finished normally.
    TurnComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        StreamEvent::TextDelta { text: text.into() }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            StreamEvent::TurnStarted { .. } => "turn_started",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::FunctionCallStarted { .. } => "function_call_started",
            StreamEvent::FunctionCallArgumentDelta { .. } => "function_call_argument_delta",
            StreamEvent::FunctionCallArgumentDone { .. } => "function_call_argument_done",
            StreamEvent::TurnTruncated { .. } => "turn_truncated",
            StreamEvent::TurnComplete { .. } => "turn_complete",
        }
    }
}
