mod cli;
mod setup;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use relay_core::config::{load_dotenv, Config};
use relay_tool_runtime::{AgenticLoop, LoopSettings, ModelTransport, ScriptedTransport, ToolContext};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();
    let args = CliArgs::parse();
    let config = match args.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };

    match args.command {
        Command::Config => print_json(&config.redacted_summary()),
        Command::Plan {
            tool,
            catalog,
            args: tool_args,
            policy,
            max_depth,
        } => {
            let tool_args: serde_json::Value =
                serde_json::from_str(&tool_args).context("--args must be a JSON object")?;
            let registry = setup::load_registry(Some(&catalog))?;
            let permissions = setup::load_permissions(policy.as_deref())?;
            let mut chains = setup::orchestrator(&config, registry, permissions);
            if let Some(depth) = max_depth {
                chains = chains.with_max_depth(depth);
            }
            let plan = chains.plan_chain(&tool, &tool_args, &ToolContext::anonymous()).await;
            print_json(&plan)
        }
        Command::Replay {
            script,
            message,
            catalog,
            policy,
            caller,
            max_iterations,
        } => {
            config.log_summary();
            let registry = setup::load_registry(catalog.as_deref())?;
            let permissions = setup::load_permissions(policy.as_deref())?;
            let chains = Arc::new(setup::orchestrator(&config, registry, permissions));
            let context = setup::caller_context(&caller)?;

            let turns = setup::load_script(&script)?;
            info!(turns = turns.len(), script = %script.display(), "Replaying event script");
            let transport: Arc<dyn ModelTransport> = Arc::new(ScriptedTransport::from_turns(turns));

            let mut settings = LoopSettings::from(&config.agent_loop);
            if let Some(max) = max_iterations {
                settings.max_iterations = max;
            }
            let agentic_loop = AgenticLoop::new(transport, chains).with_settings(settings);

            let report = agentic_loop
                .run(message, &context)
                .await
                .context("replay failed")?;
            print_json(&report)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
