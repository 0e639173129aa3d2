use crate::conversation::ConversationMessage;
use crate::stream::StreamEvent;
use async_trait::async_trait;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// A tool as offered to the model, under its provider-safe name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One outbound model request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnRequest {
    /// Items new since the turn named by `continuation_token`.
    pub input: Vec<ConversationMessage>,
    pub tools: Vec<ToolSchema>,
    /// Id of the prior turn to extend; `None` starts a fresh context.
    pub continuation_token: Option<String>,
    pub system_prompt: Option<String>,
}

/// Streaming model API as the agentic loop consumes it.
///
/// Defined here (by the consumer); concrete transports live with the
/// embedding application.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn stream_turn(&self, request: TurnRequest) -> Result<EventStream, TransportError>;

    /// Transport name for logging/debugging
    fn transport_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    Auth,
    #[error("Stream error: {0}")]
    Stream(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum ScriptedTurn {
    Events(Vec<StreamEvent>),
    Fail(String),
}

/// Serves pre-recorded turns in order and records every request.
///
/// Used to replay captured transcripts and as the base of the test mock.
pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_turns(turns: Vec<Vec<StreamEvent>>) -> Self {
        let transport = Self::new();
        for turn in turns {
            transport.push_turn(turn);
        }
        transport
    }

    pub fn push_turn(&self, events: Vec<StreamEvent>) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedTurn::Events(events));
    }

    /// The next request fails with a network error.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(ScriptedTurn::Fail(message.into()));
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn stream_turn(&self, request: TurnRequest) -> Result<EventStream, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let next = self.turns.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        match next {
            Some(ScriptedTurn::Events(events)) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
            Some(ScriptedTurn::Fail(message)) => Err(TransportError::Network(message)),
            None => Err(TransportError::InvalidResponse("script exhausted".to_string())),
        }
    }

    fn transport_name(&self) -> &str {
        "scripted"
    }
}

/// Mock transport for testing the agentic loop without a real model.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use serde_json::json;

    /// Scripted transport with helpers for common turn shapes.
    pub struct MockTransport {
        inner: ScriptedTransport,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                inner: ScriptedTransport::new(),
            }
        }

        /// Queue a raw turn that will be returned after those already queued.
        pub fn queue_turn(&self, events: Vec<StreamEvent>) {
            self.inner.push_turn(events);
        }

        /// Queue a complete text-only turn.
        pub fn queue_text(&self, turn_id: &str, text: &str) {
            self.queue_turn(vec![
                StreamEvent::TurnStarted {
                    turn_id: turn_id.to_string(),
                },
                StreamEvent::text(text),
                StreamEvent::TurnComplete {
                    turn_id: Some(turn_id.to_string()),
                },
            ]);
        }

        /// Queue a turn that stops on the output budget after `text`.
        pub fn queue_truncated(&self, turn_id: &str, text: &str) {
            self.queue_turn(vec![
                StreamEvent::TurnStarted {
                    turn_id: turn_id.to_string(),
                },
                StreamEvent::text(text),
                StreamEvent::TurnTruncated {
                    turn_id: Some(turn_id.to_string()),
                },
            ]);
        }

        /// Queue a turn issuing `calls` as `(call_id, provider_name, arguments)`.
        /// Argument text is split across two deltas.
        pub fn queue_calls(&self, turn_id: &str, calls: &[(&str, &str, Value)]) {
            let mut events = vec![StreamEvent::TurnStarted {
                turn_id: turn_id.to_string(),
            }];
            for (call_id, name, arguments) in calls {
                let text = arguments.to_string();
                let split = text.len() / 2;
                let split = (split..=text.len())
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(text.len());
                events.push(StreamEvent::FunctionCallStarted {
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                });
                for delta in [&text[..split], &text[split..]] {
                    events.push(StreamEvent::FunctionCallArgumentDelta {
                        call_id: call_id.to_string(),
                        delta: delta.to_string(),
                    });
                }
                events.push(StreamEvent::FunctionCallArgumentDone {
                    call_id: call_id.to_string(),
                    arguments: None,
                });
            }
            events.push(StreamEvent::TurnComplete {
                turn_id: Some(turn_id.to_string()),
            });
            self.queue_turn(events);
        }

        /// Queue a single call with empty arguments.
        pub fn queue_call(&self, turn_id: &str, call_id: &str, name: &str) {
            self.queue_calls(turn_id, &[(call_id, name, json!({}))]);
        }

        pub fn queue_failure(&self, message: &str) {
            self.inner.push_failure(message);
        }

        pub fn requests(&self) -> Vec<TurnRequest> {
            self.inner.requests()
        }

        pub fn remaining(&self) -> usize {
            self.inner.remaining()
        }
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ModelTransport for MockTransport {
        async fn stream_turn(&self, request: TurnRequest) -> Result<EventStream, TransportError> {
            self.inner.stream_turn(request).await
        }

        fn transport_name(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn serves_turns_in_order() {
        let transport = MockTransport::new();
        transport.queue_text("t1", "first");
        transport.queue_text("t2", "second");

        let first: Vec<_> = transport
            .stream_turn(TurnRequest::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(matches!(&first[1], Ok(StreamEvent::TextDelta { text }) if text == "first"));
        assert_eq!(transport.remaining(), 1);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn split_arguments_reassemble() {
        let transport = MockTransport::new();
        transport.queue_calls("t1", &[("c1", "projects_list", json!({"status": "ünïcode"}))]);
        let events: Vec<StreamEvent> = transport
            .stream_turn(TurnRequest::default())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::FunctionCallArgumentDelta { delta, .. } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(serde_json::from_str::<Value>(&joined).unwrap(), json!({"status": "ünïcode"}));
    }

    #[tokio::test]
    async fn exhausted_script_errors() {
        let transport = ScriptedTransport::new();
        transport.push_failure("connection refused");
        assert!(matches!(
            transport.stream_turn(TurnRequest::default()).await,
            Err(TransportError::Network(_))
        ));
        assert!(matches!(
            transport.stream_turn(TurnRequest::default()).await,
            Err(TransportError::InvalidResponse(_))
        ));
    }
}
