//! End-to-end runs of the agentic loop against a scripted model.
//!
//! Covers the multi-turn tool scenario, auto-continuation of truncated
//! output, discovery suppression, permission-filtered tool offers and
//! mid-chain suspension surfacing through the loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_core::ErrorKind;
use relay_tool_runtime::transport::mock::MockTransport;
use relay_tool_runtime::{
    AgenticLoop, AuthorizationOracle, ChainOrchestrator, ConversationMessage, LoadToolsTool, LoopError, ModelTransport,
    PermissionFilter, RunStatus, SearchToolsTool, StubTool, Tool, ToolContext, ToolDefinition, ToolExecutor,
    ToolRegistry,
};

use common::{ctx, default_pipeline, orchestrator, stub};

fn agent(registry: Arc<ToolRegistry>) -> (AgenticLoop, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let agentic_loop = AgenticLoop::new(transport.clone() as Arc<dyn ModelTransport>, orchestrator(registry));
    (agentic_loop, transport)
}

#[tokio::test]
async fn list_my_projects_takes_two_iterations() {
    let registry = Arc::new(ToolRegistry::new());
    let projects = stub(
        "projects.list",
        json!([{"id": 1, "name": "Apollo"}, {"id": 2, "name": "Gemini"}, {"id": 3, "name": "Mercury"}]),
    );
    registry.register(projects.clone());
    let (agentic_loop, transport) = agent(registry);

    transport.queue_call("turn_1", "call_abc", "projects_list");
    transport.queue_text("turn_2", "You have 3 projects: Apollo, Gemini and Mercury.");

    let report = agentic_loop.run("list my projects", &ctx()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.iterations, 2);
    assert_eq!(report.text, "You have 3 projects: Apollo, Gemini and Mercury.");
    assert_eq!(projects.calls(), 1);
    assert_eq!(report.tool_calls.len(), 1);
    assert_eq!(report.tool_calls[0].tool, "projects.list");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools.iter().any(|t| t.name == "projects_list"));
    assert!(requests[0].continuation_token.is_none());
    assert_eq!(requests[1].continuation_token.as_deref(), Some("turn_1"));
    match &requests[1].input[..] {
        [ConversationMessage::ToolOutput { call_id, output }] => {
            assert_eq!(call_id, "call_abc");
            let payload: Value = serde_json::from_str(output).unwrap();
            assert_eq!(payload["data"].as_array().unwrap().len(), 3);
        }
        other => panic!("unexpected follow-up input {other:?}"),
    }
}

#[tokio::test]
async fn truncated_turns_continue_until_complete() {
    let (agentic_loop, transport) = agent(Arc::new(ToolRegistry::new()));
    transport.queue_truncated("t1", "The quarterly ");
    transport.queue_truncated("t2", "report shows ");
    transport.queue_text("t3", "steady growth.");

    let report = agentic_loop.run("summarize", &ctx()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.text, "The quarterly report shows steady growth.");
    assert_eq!(report.continuations, 2);
    assert_eq!(report.iterations, 3);

    let requests = transport.requests();
    assert_eq!(requests[1].continuation_token.as_deref(), Some("t1"));
    assert!(requests[1].input.is_empty());
    assert_eq!(requests[2].continuation_token.as_deref(), Some("t2"));
}

#[tokio::test]
async fn continuation_cap_returns_partial_text_and_token() {
    let (agentic_loop, transport) = agent(Arc::new(ToolRegistry::new()));
    let agentic_loop = agentic_loop.with_max_continuations(2);
    for (i, chunk) in ["one ", "two ", "three ", "four "].iter().enumerate() {
        transport.queue_truncated(&format!("t{}", i + 1), chunk);
    }

    let report = agentic_loop.run("count", &ctx()).await.unwrap();

    assert_eq!(report.status, RunStatus::ContinuationLimit);
    assert_eq!(report.text, "one two three ");
    assert_eq!(report.continuations, 2);
    assert_eq!(report.continuation_token.as_deref(), Some("t3"));
    assert_eq!(transport.remaining(), 1);
}

#[tokio::test]
async fn iteration_cap_can_be_resumed() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(stub("tasks.list", json!([])));
    let (agentic_loop, transport) = agent(registry);
    let agentic_loop = agentic_loop.with_max_iterations(2);

    transport.queue_calls("t1", &[("c1", "tasks_list", json!({"status": "open"}))]);
    transport.queue_truncated("t2", "Checking the ");
    let report = agentic_loop.run("what is open?", &ctx()).await.unwrap();
    assert_eq!(report.status, RunStatus::IterationLimit);
    assert_eq!(report.text, "Checking the ");
    let token = report.continuation_token.clone().unwrap();
    assert_eq!(token, "t2");

    transport.queue_text("t3", "Nothing is open.");
    let resumed = agentic_loop.resume(token, "", &ctx()).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(resumed.text, "Nothing is open.");
}

#[tokio::test]
async fn suppressed_discovery_is_neither_offered_nor_run() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(SearchToolsTool::new(registry.clone())));
    registry.register(Arc::new(LoadToolsTool::new(registry.clone())));
    registry.register(stub("projects.list", json!([])));
    let (agentic_loop, transport) = agent(registry);
    let agentic_loop = agentic_loop.with_suppress_discovery(true);

    transport.queue_calls("t1", &[("c1", "search_tools", json!({"query": "projects"}))]);
    transport.queue_text("t2", "ok");

    let report = agentic_loop.run("find tools", &ctx()).await.unwrap();

    let offered: Vec<String> = transport.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
    assert_eq!(offered, vec!["projects_list".to_string()]);
    assert_eq!(report.tool_calls[0].error_kind, Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn discovery_loads_module_for_next_turn() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(LoadToolsTool::new(registry.clone())));
    registry.add_module(
        "billing",
        vec![stub("billing.invoices.list", json!([{"id": "inv-1"}])) as Arc<dyn Tool>],
    );
    let (agentic_loop, transport) = agent(registry);

    transport.queue_calls("t1", &[("c1", "load_tools", json!({"module": "billing"}))]);
    transport.queue_call("t2", "c2", "billing_invoices_list");
    transport.queue_text("t3", "One invoice.");

    let report = agentic_loop.run("show invoices", &ctx()).await.unwrap();

    assert!(report.is_complete());
    assert!(report.tool_calls.iter().all(|c| c.success));
    let requests = transport.requests();
    assert!(!requests[0].tools.iter().any(|t| t.name == "billing_invoices_list"));
    assert!(requests[1].tools.iter().any(|t| t.name == "billing_invoices_list"));
}

struct DenyModule(&'static str);

#[async_trait]
impl AuthorizationOracle for DenyModule {
    async fn is_allowed(&self, _context: &ToolContext, module: &str) -> bool {
        module != self.0
    }
}

#[tokio::test]
async fn denied_modules_are_hidden_and_refused() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(stub("projects.list", json!([])));
    registry.register(stub("payroll.list", json!([])));
    let executor = ToolExecutor::new(
        registry,
        PermissionFilter::new(Arc::new(DenyModule("payroll"))),
        Arc::new(default_pipeline()),
    );
    let transport = Arc::new(MockTransport::new());
    let agentic_loop = AgenticLoop::new(
        transport.clone() as Arc<dyn ModelTransport>,
        Arc::new(ChainOrchestrator::new(executor)),
    );

    transport.queue_call("t1", "c1", "payroll_list");
    transport.queue_text("t2", "I can't see payroll.");

    let report = agentic_loop.run("show payroll", &ctx()).await.unwrap();

    let offered: Vec<String> = transport.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
    assert_eq!(offered, vec!["projects_list".to_string()]);
    assert_eq!(report.tool_calls[0].error_kind, Some(ErrorKind::AccessDenied));
    assert!(report.is_complete());
}

#[tokio::test]
async fn mangled_names_are_recovered() {
    let registry = Arc::new(ToolRegistry::new());
    let create = stub("projects.create_task", json!({"id": 7}));
    registry.register(create.clone());
    let (agentic_loop, transport) = agent(registry);

    transport.queue_call("t1", "c1", "projects-create-task");
    transport.queue_text("t2", "Created.");

    let report = agentic_loop.run("new task", &ctx()).await.unwrap();
    assert_eq!(report.tool_calls[0].tool, "projects.create_task");
    assert_eq!(create.calls(), 1);
}

#[tokio::test]
async fn chain_suspension_pauses_the_run() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(
        StubTool::new(ToolDefinition::new("crm.pick_account", "", json!({"type": "object"})), json!(["acme", "globex"]))
            .asking("Which account should the report cover?"),
    ));
    let report_tool = Arc::new(StubTool::new(
        ToolDefinition::new("crm.report", "Account report", json!({"type": "object"}))
            .with_dependencies(["crm.pick_account"]),
        json!({"revenue": 1200}),
    ));
    registry.register(report_tool.clone());
    let (agentic_loop, transport) = agent(registry);

    transport.queue_call("t1", "c1", "crm_report");
    let report = agentic_loop.run("account report please", &ctx()).await.unwrap();

    let RunStatus::AwaitingInput { resume_token, prompt, call_id } = report.status.clone() else {
        panic!("expected suspension, got {:?}", report.status);
    };
    assert_eq!(prompt, "Which account should the report cover?");
    assert_eq!(call_id, "c1");
    assert_eq!(report_tool.calls(), 0);
    assert_eq!(transport.requests().len(), 1);

    transport.queue_text("t2", "Acme made 1200.");
    let resumed = agentic_loop
        .provide_input(&resume_token, json!({"answer": "acme"}), &ctx())
        .await
        .unwrap();

    assert!(resumed.is_complete());
    assert_eq!(resumed.text, "Acme made 1200.");
    assert_eq!(report_tool.calls(), 1);
    let requests = transport.requests();
    assert_eq!(requests[1].continuation_token.as_deref(), Some("t1"));
    match &requests[1].input[..] {
        [ConversationMessage::ToolOutput { call_id, output }] => {
            assert_eq!(call_id, "c1");
            assert!(output.contains("1200"));
        }
        other => panic!("unexpected follow-up input {other:?}"),
    }
}

#[tokio::test]
async fn outputs_of_the_last_batch_survive_the_iteration_cap() {
    let registry = Arc::new(ToolRegistry::new());
    let list = stub("tasks.list", json!(["write docs"]));
    registry.register(list.clone());
    registry.register(stub("tasks.owners", json!(["ana"])));
    let (agentic_loop, transport) = agent(registry);
    let agentic_loop = agentic_loop.with_max_iterations(1);

    transport.queue_calls(
        "t1",
        &[("c1", "tasks_list", json!({})), ("c2", "tasks_owners", json!({}))],
    );
    let report = agentic_loop.run("who owns what?", &ctx()).await.unwrap();
    assert_eq!(report.status, RunStatus::IterationLimit);
    assert_eq!(report.tool_calls.len(), 2);
    let ids: Vec<&str> = report
        .pending_input
        .iter()
        .filter_map(|m| match m {
            ConversationMessage::ToolOutput { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["c1", "c2"]);

    transport.queue_text("t2", "Ana owns the docs.");
    let resumed = agentic_loop.resume("t1", "", &ctx()).await.unwrap();
    assert!(resumed.is_complete());
    assert_eq!(list.calls(), 1);
    let sent = &transport.requests()[1].input;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| matches!(m, ConversationMessage::ToolOutput { .. })));
}

#[tokio::test]
async fn expired_run_suspension_is_unknown() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(
        StubTool::new(ToolDefinition::new("crm.pick_account", "", json!({"type": "object"})), json!(null))
            .asking("Which account?"),
    ));
    registry.register(Arc::new(StubTool::new(
        ToolDefinition::new("crm.report", "Account report", json!({"type": "object"}))
            .with_dependencies(["crm.pick_account"]),
        json!({}),
    )));
    let (agentic_loop, transport) = agent(registry);
    let agentic_loop = agentic_loop.with_suspension(Duration::from_millis(20), 8);

    transport.queue_call("t1", "c1", "crm_report");
    let report = agentic_loop.run("report", &ctx()).await.unwrap();
    let RunStatus::AwaitingInput { resume_token, .. } = report.status else {
        panic!("expected suspension, got {:?}", report.status);
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = agentic_loop
        .provide_input(&resume_token, json!({"answer": "acme"}), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, LoopError::UnknownResumeToken(_)));
}
