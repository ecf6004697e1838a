//! CLI argument structures.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Dependency-aware execution planner and parallel AI-agent orchestrator.
#[derive(Parser)]
#[command(name = "orchestra")]
#[command(about = "orchestra - run a hierarchical epic as parallel AI agents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) an epic to completion.
    Run {
        /// Epic identifier as known to the planning system.
        epic_id: String,

        /// Working directory item agents run in (defaults to the current directory).
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,

        /// Maximum number of agents to run concurrently within a phase.
        #[arg(short = 'n', long, default_value = "1")]
        max_agents: usize,

        /// Git branch item worktrees should be based on.
        #[arg(long)]
        base_branch: Option<String>,

        /// Override the agent model (e.g. a specific Claude model id).
        #[arg(long)]
        model: Option<String>,

        /// Stop the whole run on the first item failure instead of continuing.
        #[arg(long)]
        fail_fast: bool,

        /// Number of times to retry a failed item before giving up on it.
        #[arg(long)]
        retry: Option<u32>,

        /// Ignore any existing checkpoint and start from scratch.
        #[arg(long)]
        fresh: bool,

        /// Overall per-item timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Inactivity timeout in seconds (no output from the agent).
        #[arg(long)]
        inactivity_timeout: Option<u64>,
    },

    /// Show the resume point and completed/pending items for an epic's checkpoint.
    Status {
        /// Epic identifier.
        epic_id: String,

        /// Working directory the checkpoint lives under.
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,
    },

    /// Print the computed execution plan (phases and parallel groups) without running it.
    Plan {
        /// Epic identifier.
        epic_id: String,
    },
}
