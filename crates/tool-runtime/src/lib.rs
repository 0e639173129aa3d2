pub mod chain;
pub mod conversation;
pub mod executor;
pub mod name_mapper;
pub mod permission;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod schema;
pub mod stream;
pub mod suspension;
pub mod tool;
pub mod tools;
pub mod tracker;
pub mod transport;

pub use chain::{ChainOrchestrator, ChainOutcome, ChainPlan, ChainStep};
pub use conversation::{AssistantContent, Conversation, ConversationMessage};
pub use executor::ToolExecutor;
pub use name_mapper::{NameCache, NameMapper, Resolution};
pub use permission::{
    AuthorizationOracle, ModulePolicy, PermissionDecision, PermissionFilter, PermissionLevel, PolicyOracle,
};
pub use registry::{RegistryError, ToolRegistry};
pub use resilience::{PipelineOutcome, ResiliencePipeline, ResultSource};
pub use runtime::{AgenticLoop, LoopError, LoopPhase, LoopSettings, RunReport, RunStatus, TurnAssembler};
pub use schema::SchemaValidators;
pub use stream::StreamEvent;
pub use suspension::SuspensionStore;
pub use tool::{Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolMetadata, ToolResult};
pub use tools::{EchoTool, LoadToolsTool, SearchToolsTool, StubTool};
pub use tracker::{ExecutionRecord, ExecutionTracker, LogTracker};
pub use transport::{ModelTransport, ScriptedTransport, ToolSchema, TransportError, TurnRequest};
