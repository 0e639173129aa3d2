use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Operator tool for the relay tool runtime.
///
/// Inspects the resolved configuration, plans dependency chains over a
/// tool catalog, and replays recorded model transcripts through the
/// agentic loop.
#[derive(Parser, Debug)]
#[command(name = "relay-cli", about = "Operator tool for the relay tool runtime")]
pub struct CliArgs {
    /// Configuration profile (overrides RELAY_PROFILE)
    #[arg(long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the resolved configuration with secrets and paths redacted
    Config,

    /// Plan the dependency chain for a tool
    Plan {
        /// Canonical tool name, e.g. crm.report
        tool: String,

        /// JSON tool catalog
        #[arg(long)]
        catalog: PathBuf,

        /// Arguments the target would be called with, as JSON
        #[arg(long, default_value = "{}")]
        args: String,

        /// Module policy JSON; every module is allowed when omitted
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Dependency depth limit (defaults to CHAIN_MAX_DEPTH)
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Run a recorded event script through the agentic loop
    Replay {
        /// JSON array of turns, each an array of stream events
        #[arg(long)]
        script: PathBuf,

        /// User message that starts the run
        #[arg(long)]
        message: String,

        /// JSON tool catalog backing the scripted calls
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Module policy JSON; every module is allowed when omitted
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Caller identity as user@tenant
        #[arg(long, default_value = "operator@local")]
        caller: String,

        /// Maximum agentic loop iterations (defaults to LOOP_MAX_ITERATIONS)
        #[arg(long)]
        max_iterations: Option<usize>,
    },
}
