//! CLI front end (C-cli): a thin layer translating parsed arguments into
//! `PlanningClient`/`Orchestrator` calls.
//!
//! Grounded in the teacher's `cli/args.rs` + `cli/router.rs` split, scaled
//! down to this crate's three subcommands.

mod args;

pub use args::{Cli, Commands};

use crate::agent::subprocess::AgentSubprocessClient;
use crate::checkpoint::{find_resume_point, CheckpointManager};
use crate::error::helpers;
use crate::orchestrator::{OnItemFailure, Orchestrator, RunConfig};
use crate::planning::PlanningClient;
use crate::status::{StatusBroadcaster, StatusEvent};
use std::time::Duration;
use tracing::info;

/// Dispatches a parsed command. The planning token is read from
/// `ORCHESTRA_TOKEN`; its absence is a fatal config error before any network
/// call is attempted.
pub async fn execute_command(
    command: Commands,
    base_url: &str,
    token: Option<String>,
) -> anyhow::Result<()> {
    let token = token.ok_or_else(|| {
        helpers::config("ORCHESTRA_TOKEN is not set; the planning API requires a bearer token")
    })?;
    let planning = PlanningClient::new(base_url.to_string(), token)?;

    match command {
        Commands::Run {
            epic_id,
            path,
            max_agents,
            base_branch,
            model,
            fail_fast,
            retry,
            fresh,
            timeout,
            inactivity_timeout,
        } => {
            let cwd = path.unwrap_or_else(|| std::env::current_dir().expect("cwd available"));
            let mut cfg = RunConfig::new(epic_id, cwd);
            cfg.max_agents = max_agents.max(1);
            cfg.base_branch = base_branch;
            cfg.model = model;
            cfg.resume_if_present = !fresh;
            cfg.on_item_failure = match (fail_fast, retry) {
                (true, _) => OnItemFailure::FailFast,
                (false, Some(n)) => OnItemFailure::RetryUpTo(n),
                (false, None) => OnItemFailure::Continue,
            };
            cfg.overall_timeout = timeout.map(Duration::from_secs);
            cfg.inactivity_timeout = inactivity_timeout.map(Duration::from_secs);

            let subprocess = AgentSubprocessClient::new("claude");
            let broadcaster = StatusBroadcaster::new();
            let mut events = broadcaster.subscribe();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    log_event(&event);
                }
            });

            let orchestrator = Orchestrator::new(planning, subprocess, broadcaster);
            let result = orchestrator.run(cfg).await?;

            println!("{}", result.summary);
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::Status { epic_id, path } => {
            let cwd = path.unwrap_or_else(|| std::env::current_dir().expect("cwd available"));
            let manager = CheckpointManager::default_in(&cwd);
            let loaded = manager.load().await;
            match loaded.state {
                Some(state) => {
                    let resume = find_resume_point(&state);
                    println!("epic: {} ({})", state.epic_identifier, epic_id);
                    println!("phase: {}/{}", state.current_phase, state.total_phases);
                    println!("completed items: {}", state.completed_items.len());
                    println!("resume phase: {}", resume.phase);
                    println!("retry items: {}", resume.retry_items.len());
                    Ok(())
                }
                None => {
                    let reason = loaded
                        .reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("no usable checkpoint for {epic_id} ({reason})");
                    Ok(())
                }
            }
        }

        Commands::Plan { epic_id } => {
            let plan = planning.get_execution_plan(&epic_id).await?;
            for phase in &plan.phases {
                println!(
                    "phase {} ({}): {} item(s)",
                    phase.order,
                    if phase.can_run_in_parallel { "parallel" } else { "sequential" },
                    phase.items.len()
                );
                for item in &phase.items {
                    println!("  - {} {}", item.identifier, item.title);
                }
            }
            Ok(())
        }
    }
}

fn log_event(event: &StatusEvent) {
    match event {
        StatusEvent::ItemFailed { id, error_kind, message } => {
            tracing::warn!(item = %id, kind = %error_kind, "item failed: {message}");
        }
        StatusEvent::ItemCompleted { id } => info!(item = %id, "item completed"),
        StatusEvent::PhaseStarted { order, item_ids } => {
            info!(phase = order, count = item_ids.len(), "phase started")
        }
        other => tracing::debug!(?other, "status event"),
    }
}
