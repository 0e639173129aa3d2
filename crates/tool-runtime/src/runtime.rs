use crate::chain::{ChainOrchestrator, ChainOutcome};
use crate::conversation::{AssistantContent, Conversation, ConversationMessage};
use crate::name_mapper::{NameMapper, Resolution};
use crate::stream::StreamEvent;
use crate::suspension::SuspensionStore;
use crate::tool::{ToolCall, ToolContext, ToolResult};
use crate::transport::{ModelTransport, ToolSchema, TransportError, TurnRequest};
use futures::StreamExt;
use relay_core::config::LoopConfig;
use relay_core::ErrorKind;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Checked before every outbound model request; `true` stops the run.
pub type AbortSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Sending,
    Streaming,
    ToolExecuting,
    Continuing,
    Done,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Model turns per run, auto-continuations included.
    pub max_iterations: usize,
    pub max_continuations: usize,
    pub suppress_discovery: bool,
    pub chain_max_depth: usize,
    pub system_prompt: Option<String>,
    /// Approximate token budget of the caller-visible transcript.
    pub transcript_tokens: usize,
    /// How long suspended runs and unsent tool outputs stay resumable.
    pub suspension_ttl: Duration,
    pub suspension_capacity: usize,
}

impl From<&LoopConfig> for LoopSettings {
    fn from(c: &LoopConfig) -> Self {
        Self {
            max_iterations: c.max_iterations,
            max_continuations: c.max_continuations,
            suppress_discovery: c.suppress_discovery,
            chain_max_depth: c.chain_max_depth,
            system_prompt: None,
            transcript_tokens: 100_000,
            suspension_ttl: Duration::from_secs(c.suspension_ttl_secs),
            suspension_capacity: c.suspension_capacity,
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&LoopConfig::default())
    }
}

/// A function call as assembled from the stream, before name resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledCall {
    pub call_id: String,
    /// Provider-safe name as the model sent it.
    pub name: String,
    /// Parsed arguments, or the parse error.
    pub arguments: Result<Value, String>,
}

/// Everything one model turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledTurn {
    pub turn_id: Option<String>,
    pub text: String,
    /// Calls that received their arguments-done signal, in start order.
    pub calls: Vec<AssembledCall>,
    pub truncated: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Default)]
struct PendingCall {
    name: String,
    arguments: String,
    done: bool,
}

/// Folds the events of one turn. Argument fragments are concatenated per
/// call id in arrival order; a call only counts once its arguments are done.
#[derive(Debug, Default)]
pub struct TurnAssembler {
    turn_id: Option<String>,
    text: String,
    pending: HashMap<String, PendingCall>,
    order: Vec<String>,
    truncated: bool,
    complete: bool,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything from the previous turn.
    pub fn begin_turn(&mut self) {
        *self = Self::default();
    }

    /// Calls seen so far in this turn, keyed by call id.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TurnStarted { turn_id } => {
                self.turn_id = Some(turn_id);
            }
            StreamEvent::TextDelta { text } => {
                self.text.push_str(&text);
            }
            StreamEvent::FunctionCallStarted { call_id, name } => {
                self.entry(&call_id).name = name;
            }
            StreamEvent::FunctionCallArgumentDelta { call_id, delta } => {
                let call = self.entry(&call_id);
                if call.done {
                    warn!(call_id = %call_id, "Argument delta after arguments were done");
                }
                call.arguments.push_str(&delta);
            }
            StreamEvent::FunctionCallArgumentDone { call_id, arguments } => {
                let call = self.entry(&call_id);
                if let Some(full) = arguments {
                    call.arguments = full;
                }
                call.done = true;
            }
            StreamEvent::TurnTruncated { turn_id } => {
                self.truncated = true;
                if self.turn_id.is_none() {
                    self.turn_id = turn_id;
                }
            }
            StreamEvent::TurnComplete { turn_id } => {
                self.complete = true;
                if self.turn_id.is_none() {
                    self.turn_id = turn_id;
                }
            }
        }
    }

    /// Hand over the finished turn and reset.
    pub fn take(&mut self) -> AssembledTurn {
        let mut finished = std::mem::take(self);
        let mut calls = Vec::with_capacity(finished.order.len());
        for call_id in finished.order {
            let Some(call) = finished.pending.remove(&call_id) else {
                continue;
            };
            if !call.done {
                warn!(call_id = %call_id, name = %call.name, "Dropping function call without completed arguments");
                continue;
            }
            if call.name.is_empty() {
                warn!(call_id = %call_id, "Dropping function call that never announced a name");
                continue;
            }
            calls.push(AssembledCall {
                arguments: parse_arguments(&call.arguments),
                call_id,
                name: call.name,
            });
        }
        AssembledTurn {
            turn_id: finished.turn_id,
            text: finished.text,
            calls,
            truncated: finished.truncated,
            complete: finished.complete,
        }
    }

    fn entry(&mut self, call_id: &str) -> &mut PendingCall {
        if !self.pending.contains_key(call_id) {
            self.order.push(call_id.to_string());
        }
        self.pending.entry(call_id.to_string()).or_default()
    }
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| format!("function call arguments are not valid JSON: {e}"))
}

/// Mutable state of one run.
#[derive(Debug)]
pub struct LoopState {
    pub phase: LoopPhase,
    pub iterations: usize,
    pub continuations: usize,
    /// Assistant text since the last tool execution.
    pub text: String,
    pub continuation_token: Option<String>,
    pub assembler: TurnAssembler,
}

impl LoopState {
    pub fn new(continuation_token: Option<String>) -> Self {
        Self {
            phase: LoopPhase::Sending,
            iterations: 0,
            continuations: 0,
            text: String::new(),
            continuation_token,
            assembler: TurnAssembler::new(),
        }
    }

    fn enter(&mut self, phase: LoopPhase) {
        debug!(from = ?self.phase, to = ?phase, iteration = self.iterations, "Loop phase");
        self.phase = phase;
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// The model answered without further calls.
    Completed,
    /// Iteration budget spent; resume with the continuation token.
    IterationLimit,
    /// Truncated output kept coming past the continuation budget.
    ContinuationLimit,
    /// The abort signal fired before a request.
    Aborted,
    /// A chain needs user input; answer with [`AgenticLoop::provide_input`].
    AwaitingInput {
        resume_token: String,
        prompt: String,
        call_id: String,
    },
}

/// Summary of one executed function call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedCall {
    pub call_id: String,
    /// Canonical tool name
    pub tool: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    /// Final answer, or the partial text when the run stopped early.
    pub text: String,
    pub iterations: usize,
    pub continuations: usize,
    pub continuation_token: Option<String>,
    pub tool_calls: Vec<ExecutedCall>,
    pub transcript: Vec<ConversationMessage>,
    /// Tool outputs produced but never sent because the run stopped first.
    /// [`AgenticLoop::resume`] with the same continuation token sends them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_input: Vec<ConversationMessage>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No continuation token to resume from at iteration {iteration}")]
    MissingContinuationToken { iteration: usize },
    #[error("Unknown resume token: {0}")]
    UnknownResumeToken(String),
}

struct SuspendedRun {
    continuation_token: Option<String>,
    call_id: String,
    /// Canonical name of the tool that was called.
    tool: String,
    /// Outputs already produced in the suspended turn.
    outputs: Vec<ConversationMessage>,
    /// Calls of the suspended turn not yet executed.
    remaining: Vec<AssembledCall>,
}

enum CallOutcome {
    Done(ToolResult),
    Suspended {
        resume_token: String,
        prompt: String,
        result: ToolResult,
    },
}

impl CallOutcome {
    fn result(&self) -> &ToolResult {
        match self {
            CallOutcome::Done(result) | CallOutcome::Suspended { result, .. } => result,
        }
    }
}

struct Pending {
    resume_token: String,
    prompt: String,
    call_id: String,
    tool: String,
}

struct Run<'a> {
    context: &'a ToolContext,
    state: LoopState,
    transcript: Conversation,
    calls: Vec<ExecutedCall>,
    unsent: Vec<ConversationMessage>,
}

impl Run<'_> {
    fn record(&mut self, call_id: &str, tool: &str, result: &ToolResult) {
        self.calls.push(ExecutedCall {
            call_id: call_id.to_string(),
            tool: tool.to_string(),
            success: result.success,
            error_kind: result.kind(),
        });
    }

    fn finish(mut self, status: RunStatus) -> RunReport {
        self.state.enter(LoopPhase::Done);
        info!(
            status = ?status,
            iterations = self.state.iterations,
            continuations = self.state.continuations,
            tool_calls = self.calls.len(),
            trace_id = %self.context.trace_id,
            "Agentic run finished"
        );
        RunReport {
            status,
            text: self.state.text,
            iterations: self.state.iterations,
            continuations: self.state.continuations,
            continuation_token: self.state.continuation_token,
            tool_calls: self.calls,
            transcript: self.transcript.into_messages(),
            pending_input: self.unsent,
        }
    }
}

/// The core agentic loop that orchestrates model ↔ tool execution.
///
/// Flow: user → model turn → function calls → execute → outputs → model
/// turn (continued by token) → ... → final text.
pub struct AgenticLoop {
    transport: Arc<dyn ModelTransport>,
    orchestrator: Arc<ChainOrchestrator>,
    names: Arc<NameMapper>,
    settings: LoopSettings,
    abort: Option<AbortSignal>,
    suspended: SuspensionStore<SuspendedRun>,
    /// Tool outputs a stopped run still owes the model, by continuation token.
    unsent: SuspensionStore<Vec<ConversationMessage>>,
}

impl AgenticLoop {
    pub fn new(transport: Arc<dyn ModelTransport>, orchestrator: Arc<ChainOrchestrator>) -> Self {
        let names = Arc::new(NameMapper::new(orchestrator.executor().registry().clone()));
        let settings = LoopSettings::default();
        Self {
            transport,
            orchestrator,
            names,
            suspended: SuspensionStore::new(settings.suspension_ttl, settings.suspension_capacity),
            unsent: SuspensionStore::new(settings.suspension_ttl, settings.suspension_capacity),
            settings,
            abort: None,
        }
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self.rebuild_stores();
        self
    }

    pub fn with_suspension(mut self, ttl: Duration, capacity: usize) -> Self {
        self.settings.suspension_ttl = ttl;
        self.settings.suspension_capacity = capacity;
        self.rebuild_stores();
        self
    }

    fn rebuild_stores(&mut self) {
        let (ttl, capacity) = (self.settings.suspension_ttl, self.settings.suspension_capacity);
        self.suspended = SuspensionStore::new(ttl, capacity);
        self.unsent = SuspensionStore::new(ttl, capacity);
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.settings.max_iterations = max;
        self
    }

    pub fn with_max_continuations(mut self, max: usize) -> Self {
        self.settings.max_continuations = max;
        self
    }

    pub fn with_suppress_discovery(mut self, suppress: bool) -> Self {
        self.settings.suppress_discovery = suppress;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.settings.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_name_mapper(mut self, names: Arc<NameMapper>) -> Self {
        self.names = names;
        self
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run one user message to a final answer or a stopping point.
    pub async fn run(&self, message: impl Into<String>, context: &ToolContext) -> Result<RunReport, LoopError> {
        let input = vec![ConversationMessage::user(message)];
        self.drive(self.start(context, None, &input), input).await
    }

    /// Continue from a token returned by an earlier run. Tool outputs the
    /// earlier run stopped before sending go first; an empty message just
    /// asks the model to carry on.
    pub async fn resume(
        &self,
        continuation_token: impl Into<String>,
        message: impl Into<String>,
        context: &ToolContext,
    ) -> Result<RunReport, LoopError> {
        let continuation_token = continuation_token.into();
        let message = message.into();
        let mut input = self.unsent.take(&continuation_token).unwrap_or_default();
        if !input.is_empty() {
            debug!(outputs = input.len(), "Sending tool outputs left over from the previous run");
        }
        if !message.is_empty() {
            input.push(ConversationMessage::user(message));
        }
        let run = self.start(context, Some(continuation_token), &input);
        self.drive(run, input).await
    }

    /// Answer a chain that suspended for user input, finish the rest of
    /// that turn's calls, and continue the run.
    pub async fn provide_input(
        &self,
        resume_token: &str,
        input: Value,
        context: &ToolContext,
    ) -> Result<RunReport, LoopError> {
        let Some(suspended) = self.suspended.take(resume_token) else {
            return Err(LoopError::UnknownResumeToken(resume_token.to_string()));
        };

        let mut run = self.start(context, suspended.continuation_token, &[]);
        run.state.enter(LoopPhase::ToolExecuting);
        let mut outputs = suspended.outputs;

        match self.orchestrator.resume(resume_token, input, context).await {
            ChainOutcome::Suspended {
                resume_token,
                prompt,
                result,
                ..
            } => {
                run.record(&suspended.call_id, &suspended.tool, &result);
                let pending = Pending {
                    resume_token,
                    prompt,
                    call_id: suspended.call_id,
                    tool: suspended.tool,
                };
                return Ok(self.suspend(run, pending, outputs, suspended.remaining));
            }
            other => {
                let result = other.into_result();
                run.record(&suspended.call_id, &suspended.tool, &result);
                let output = ConversationMessage::tool_output(&suspended.call_id, &result);
                run.transcript.push(output.clone());
                outputs.push(output);
            }
        }

        match self.execute_batch(&mut run, suspended.remaining, outputs).await {
            Ok(outputs) => self.drive(run, outputs).await,
            Err((pending, outputs, remaining)) => Ok(self.suspend(run, pending, outputs, remaining)),
        }
    }

    /// Tool schemas offered to the model for this caller.
    pub async fn offered_tools(&self, context: &ToolContext) -> Vec<ToolSchema> {
        let executor = self.orchestrator.executor();
        let definitions: Vec<_> = executor
            .registry()
            .definitions()
            .into_iter()
            .filter(|def| !(self.settings.suppress_discovery && def.metadata.discovery))
            .collect();
        executor
            .permissions()
            .filter(definitions, context)
            .await
            .into_iter()
            .map(|def| ToolSchema {
                name: self.names.to_provider(&def.name),
                description: def.description,
                parameters: def.input_schema,
            })
            .collect()
    }

    fn start<'a>(
        &self,
        context: &'a ToolContext,
        continuation_token: Option<String>,
        input: &[ConversationMessage],
    ) -> Run<'a> {
        let mut transcript = Conversation::new(self.settings.transcript_tokens);
        if let Some(prompt) = &self.settings.system_prompt {
            transcript = transcript.with_system_prompt(prompt.clone());
        }
        for message in input {
            transcript.push(message.clone());
        }
        Run {
            context,
            state: LoopState::new(continuation_token),
            transcript,
            calls: Vec::new(),
            unsent: Vec::new(),
        }
    }

    async fn drive(&self, mut run: Run<'_>, mut input: Vec<ConversationMessage>) -> Result<RunReport, LoopError> {
        loop {
            if run.state.iterations >= self.settings.max_iterations {
                warn!(
                    iterations = run.state.iterations,
                    max_iterations = self.settings.max_iterations,
                    "Iteration limit reached"
                );
                return Ok(self.stop(run, RunStatus::IterationLimit, input));
            }
            if self.abort.as_ref().is_some_and(|abort| abort()) {
                info!(iteration = run.state.iterations, "Run aborted by caller");
                return Ok(self.stop(run, RunStatus::Aborted, input));
            }

            run.state.enter(LoopPhase::Sending);
            run.state.iterations += 1;
            let request = TurnRequest {
                input: std::mem::take(&mut input),
                tools: self.offered_tools(run.context).await,
                continuation_token: run.state.continuation_token.clone(),
                system_prompt: self.settings.system_prompt.clone(),
            };
            let mut stream = self.transport.stream_turn(request).await?;

            run.state.enter(LoopPhase::Streaming);
            run.state.assembler.begin_turn();
            while let Some(event) = stream.next().await {
                run.state.assembler.apply(event?);
            }
            let turn = run.state.assembler.take();
            if !turn.complete && !turn.truncated {
                warn!(iteration = run.state.iterations, "Stream ended without a turn terminator");
                return Err(TransportError::Stream("stream ended before the turn completed".into()).into());
            }

            if let Some(turn_id) = turn.turn_id.clone() {
                run.state.continuation_token = Some(turn_id);
            }
            run.state.text.push_str(&turn.text);
            self.record_assistant(&mut run, &turn);

            if turn.calls.is_empty() {
                if !turn.truncated {
                    return Ok(run.finish(RunStatus::Completed));
                }
                if run.state.continuations >= self.settings.max_continuations {
                    warn!(
                        continuations = run.state.continuations,
                        "Continuation limit reached with truncated output"
                    );
                    self.require_token(&run)?;
                    return Ok(run.finish(RunStatus::ContinuationLimit));
                }
                run.state.continuations += 1;
                run.state.enter(LoopPhase::Continuing);
                self.require_token(&run)?;
                continue;
            }

            run.state.enter(LoopPhase::ToolExecuting);
            info!(count = turn.calls.len(), iteration = run.state.iterations, "Executing function calls");
            match self.execute_batch(&mut run, turn.calls, Vec::new()).await {
                Ok(outputs) => input = outputs,
                Err((pending, outputs, remaining)) => {
                    return Ok(self.suspend(run, pending, outputs, remaining));
                }
            }
            run.state.text.clear();
            run.state.enter(LoopPhase::Continuing);
            self.require_token(&run)?;
        }
    }

    /// Finish a run that stopped before sending `unsent`. The outputs ride
    /// along in the report and are parked under the continuation token for
    /// [`AgenticLoop::resume`].
    fn stop(&self, mut run: Run<'_>, status: RunStatus, unsent: Vec<ConversationMessage>) -> RunReport {
        if !unsent.is_empty() {
            if let Some(token) = &run.state.continuation_token {
                debug!(outputs = unsent.len(), "Parking unsent tool outputs");
                self.unsent.park(token.clone(), unsent.clone());
            }
        }
        run.unsent = unsent;
        run.finish(status)
    }

    fn require_token(&self, run: &Run<'_>) -> Result<(), LoopError> {
        if run.state.continuation_token.is_none() {
            return Err(LoopError::MissingContinuationToken {
                iteration: run.state.iterations,
            });
        }
        Ok(())
    }

    fn record_assistant(&self, run: &mut Run<'_>, turn: &AssembledTurn) {
        let tool_calls = turn
            .calls
            .iter()
            .map(|call| ToolCall {
                id: call.call_id.clone(),
                name: self.names.to_canonical(&call.name),
                input: call.arguments.clone().unwrap_or(Value::Null),
            })
            .collect();
        run.transcript.push(ConversationMessage::Assistant(AssistantContent {
            text: (!turn.text.is_empty()).then(|| turn.text.clone()),
            tool_calls,
        }));
    }

    /// Execute `calls` in order. Stops at the first chain suspension and
    /// hands back what is needed to pick up from there.
    async fn execute_batch(
        &self,
        run: &mut Run<'_>,
        calls: Vec<AssembledCall>,
        mut outputs: Vec<ConversationMessage>,
    ) -> Result<Vec<ConversationMessage>, (Pending, Vec<ConversationMessage>, Vec<AssembledCall>)> {
        let mut calls = calls.into_iter();
        while let Some(call) = calls.next() {
            let (tool, outcome) = self.execute_call(&call, run.context).await;
            run.record(&call.call_id, &tool, outcome.result());
            match outcome {
                CallOutcome::Done(result) => {
                    let output = ConversationMessage::tool_output(&call.call_id, &result);
                    run.transcript.push(output.clone());
                    outputs.push(output);
                }
                CallOutcome::Suspended { resume_token, prompt, .. } => {
                    let pending = Pending {
                        resume_token,
                        prompt,
                        call_id: call.call_id,
                        tool,
                    };
                    return Err((pending, outputs, calls.collect()));
                }
            }
        }
        Ok(outputs)
    }

    async fn execute_call(&self, call: &AssembledCall, context: &ToolContext) -> (String, CallOutcome) {
        let (tool, resolution) = self.names.resolve(&call.name);
        debug!(call_id = %call.call_id, requested = %call.name, tool = %tool, "Resolved function call");

        let arguments = match &call.arguments {
            Ok(arguments) => arguments.clone(),
            Err(message) => {
                let result = ToolResult::failure(ErrorKind::Validation, message.clone());
                return (tool, CallOutcome::Done(result));
            }
        };

        let executor = self.orchestrator.executor();
        if self.settings.suppress_discovery
            && executor
                .registry()
                .definition(&tool)
                .is_some_and(|def| def.metadata.discovery)
        {
            let result = ToolResult::failure(
                ErrorKind::NotFound,
                format!("Tool {tool} is not available in this run"),
            );
            return (tool, CallOutcome::Done(result));
        }

        let mut result = if self.orchestrator.has_dependencies(&tool) {
            match self
                .orchestrator
                .execute_with_dependencies(&tool, arguments, context, self.settings.chain_max_depth)
                .await
            {
                ChainOutcome::Suspended {
                    resume_token,
                    prompt,
                    result,
                    ..
                } => {
                    let outcome = CallOutcome::Suspended {
                        resume_token,
                        prompt,
                        result,
                    };
                    return (tool, outcome);
                }
                other => other.into_result(),
            }
        } else {
            executor.execute(&tool, arguments, context).await
        };

        if resolution != Resolution::Exact {
            result = result.with_metadata("resolved_tool", json!(tool));
        }
        (tool, CallOutcome::Done(result))
    }

    fn suspend(
        &self,
        mut run: Run<'_>,
        pending: Pending,
        outputs: Vec<ConversationMessage>,
        remaining: Vec<AssembledCall>,
    ) -> RunReport {
        info!(call_id = %pending.call_id, "Run suspended for user input");
        self.suspended.park(
            pending.resume_token.clone(),
            SuspendedRun {
                continuation_token: run.state.continuation_token.clone(),
                call_id: pending.call_id.clone(),
                tool: pending.tool,
                outputs,
                remaining,
            },
        );
        run.state.text.clear();
        run.finish(RunStatus::AwaitingInput {
            resume_token: pending.resume_token,
            prompt: pending.prompt,
            call_id: pending.call_id,
        })
    }
}
