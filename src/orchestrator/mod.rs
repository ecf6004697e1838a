//! Agent Pool / Orchestrator (C6) — drives the execution plan: acquires up
//! to `max_agents` concurrent agents, dispatches items per phase, aggregates
//! progress, and commits every state change through the checkpoint and
//! status layers.
//!
//! Grounded in the teacher's `cook::execution::mapreduce` dispatch loop
//! (single coordinator task, worker tasks report through a channel) and
//! `worktree::manager` for per-item working directories, generalized from a
//! flat MapReduce item list into the phase/dependency model in spec.md §4.5.

use crate::agent::session::{AgentSession, SessionOptions, SessionState};
use crate::agent::subprocess::AgentSubprocessClient;
use crate::checkpoint::{Checkpoint, CheckpointManager, InProgressItem};
use crate::error::{ErrorKind, OrchestraError};
use crate::model::{ExecutionPlan, Phase, WorkItem, WorkItemType};
use crate::planning::{PlanningClient, ResourceKind};
use crate::status::{StatusBroadcaster, StatusEvent};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What to do when a dispatched item fails (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnItemFailure {
    FailFast,
    Continue,
    RetryUpTo(u32),
}

/// Closed set of options accepted by [`Orchestrator::run`] (§6).
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub epic_id: String,
    pub max_agents: usize,
    pub cwd: PathBuf,
    pub base_branch: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub on_item_failure: OnItemFailure,
    pub resume_if_present: bool,
    pub checkpoint_dir: Option<PathBuf>,
    pub overall_timeout: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

impl RunConfig {
    pub fn new(epic_id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            epic_id: epic_id.into(),
            max_agents: 1,
            cwd: cwd.into(),
            base_branch: None,
            model: None,
            system_prompt: None,
            allowed_tools: None,
            on_item_failure: OnItemFailure::Continue,
            resume_if_present: true,
            checkpoint_dir: None,
            overall_timeout: None,
            inactivity_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedItem {
    pub id: String,
    pub error: String,
}

/// The outcome of a complete run (§6).
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub duration: Duration,
    pub completed_items: Vec<String>,
    pub failed_items: Vec<FailedItem>,
    pub summary: String,
}

struct RunFlags {
    cancelled: AtomicBool,
    paused: AtomicBool,
}

/// Drives a plan to completion. Owns the checkpoint file and the in-memory
/// pool map exclusively; workers reach neither directly (§4.6, §5).
pub struct Orchestrator {
    planning: Arc<PlanningClient>,
    subprocess: Arc<AgentSubprocessClient>,
    broadcaster: StatusBroadcaster,
    flags: Arc<RunFlags>,
}

impl Orchestrator {
    pub fn new(planning: PlanningClient, subprocess: AgentSubprocessClient, broadcaster: StatusBroadcaster) -> Self {
        Self {
            planning: Arc::new(planning),
            subprocess: Arc::new(subprocess),
            broadcaster,
            flags: Arc::new(RunFlags {
                cancelled: AtomicBool::new(false),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Sets a flag and cancels every currently running agent; in-flight
    /// `sendAndWait` calls resolve with a cancellation error and the phase
    /// loop exits without advancing (§4.6). Idempotent.
    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::SeqCst);
    }

    /// Prevents dispatch of new items but lets in-flight items finish.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    pub async fn run(&self, cfg: RunConfig) -> Result<RunResult, OrchestraError> {
        let started = Instant::now();
        let checkpoint_dir = cfg
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| cfg.cwd.join(".spectree"));
        let manager = Arc::new(CheckpointManager::new(&checkpoint_dir));

        let plan = self.planning.get_execution_plan(&cfg.epic_id).await?;

        let (state, resume_skip, resume_retry) = self.load_or_init_checkpoint(&manager, &cfg, &plan).await?;

        self.broadcaster.publish(StatusEvent::RunStarted);

        let mut completed: HashSet<String> = state.completed_items.clone();
        let mut failed_items: Vec<FailedItem> = Vec::new();
        let total_items = plan.total_items;

        for phase in &plan.phases {
            if phase.order < resume_skip {
                continue;
            }

            if self.flags.cancelled.load(Ordering::SeqCst) {
                break;
            }

            let pending: Vec<WorkItem> = phase
                .items
                .iter()
                .filter(|item| !completed.contains(&item.id))
                .cloned()
                .collect();

            if pending.is_empty() {
                continue;
            }

            self.broadcaster.publish(StatusEvent::PhaseStarted {
                order: phase.order,
                item_ids: pending.iter().map(|i| i.id.clone()).collect(),
            });

            let outcomes = self
                .dispatch_phase(&cfg, phase, pending, &resume_retry, &manager)
                .await;

            for outcome in outcomes {
                match outcome {
                    Ok(id) => {
                        completed.insert(id);
                    }
                    Err(failure) => {
                        failed_items.push(failure.clone());
                        if cfg.on_item_failure == OnItemFailure::FailFast {
                            self.flags.cancelled.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }

            self.broadcaster.publish(StatusEvent::PhaseCompleted { order: phase.order });

            manager
                .update(|s| {
                    s.current_phase = phase.order;
                })
                .await?;

            if self.flags.cancelled.load(Ordering::SeqCst) {
                break;
            }
        }

        let success = !self.flags.cancelled.load(Ordering::SeqCst)
            && (failed_items.is_empty() || cfg.on_item_failure != OnItemFailure::FailFast);

        let summary = format!(
            "{}/{} items completed, {} failed",
            completed.len(),
            total_items,
            failed_items.len()
        );

        self.broadcaster.publish(StatusEvent::RunCompleted {
            completed: completed.len(),
            failed: failed_items.len(),
            success,
        });

        Ok(RunResult {
            success,
            duration: started.elapsed(),
            completed_items: completed.into_iter().collect(),
            failed_items,
            summary,
        })
    }

    async fn load_or_init_checkpoint(
        &self,
        manager: &CheckpointManager,
        cfg: &RunConfig,
        plan: &ExecutionPlan,
    ) -> Result<(Checkpoint, u32, Vec<String>), OrchestraError> {
        if cfg.resume_if_present {
            let loaded = manager.load().await;
            if let Some(state) = loaded.state {
                let resume = crate::checkpoint::find_resume_point(&state);
                info!(
                    "resuming run at phase {} with {} items already completed",
                    resume.phase,
                    resume.skip_items.len()
                );
                return Ok((state, resume.phase, resume.retry_items));
            }
            if let Some(reason) = loaded.reason {
                if !matches!(reason, crate::checkpoint::LoadReason::NotFound) {
                    warn!("checkpoint present but unusable ({reason}); starting a fresh run");
                }
            }
        }

        let epic = self.planning.get_epic(&cfg.epic_id).await?;
        let state = Checkpoint::new(
            epic.id.clone(),
            epic.identifier.clone(),
            uuid::Uuid::new_v4().to_string(),
            cfg.base_branch.clone().unwrap_or_else(|| "main".to_string()),
            cfg.cwd.clone(),
            plan.phases.len() as u32,
        );
        manager.save(state.clone()).await?;
        Ok((state, 0, Vec::new()))
    }

    /// Dispatches every pending item in a phase, respecting `canRunInParallel`
    /// and `max_agents`, and returns one outcome per item.
    async fn dispatch_phase(
        &self,
        cfg: &RunConfig,
        phase: &Phase,
        pending: Vec<WorkItem>,
        force_retry_from_scratch: &[String],
        manager: &Arc<CheckpointManager>,
    ) -> Vec<Result<String, FailedItem>> {
        let concurrency = if phase.can_run_in_parallel {
            cfg.max_agents.max(1)
        } else {
            1
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(pending.len());

        for item in pending {
            if self.flags.cancelled.load(Ordering::SeqCst) {
                break;
            }
            while self.flags.paused.load(Ordering::SeqCst) && !self.flags.cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let retry_from_scratch = force_retry_from_scratch.contains(&item.id);
            let this_cfg = cfg.clone();
            let manager = manager.clone();
            let planning = self.planning.clone();
            let subprocess = self.subprocess.clone();
            let broadcaster = self.broadcaster.clone();
            let flags = self.flags.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let max_attempts = match this_cfg.on_item_failure {
                    OnItemFailure::RetryUpTo(k) => k + 1,
                    _ => 1,
                };

                let mut last = None;
                for attempt in 1..=max_attempts {
                    let outcome = dispatch_one_item(
                        &planning,
                        &subprocess,
                        &broadcaster,
                        &flags,
                        &this_cfg,
                        item.clone(),
                        retry_from_scratch || attempt > 1,
                        &manager,
                    )
                    .await;
                    if outcome.is_ok() || attempt == max_attempts {
                        last = Some(outcome);
                        break;
                    }
                    warn!("item {} failed on attempt {attempt}/{max_attempts}; retrying", item.id);
                }
                last.expect("loop runs at least once")
            });
            handles.push(handle);
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => results.push(outcome),
                Err(join_err) => results.push(Err(FailedItem {
                    id: "unknown".to_string(),
                    error: format!("worker task panicked: {join_err}"),
                })),
            }
        }
        results
    }
}

async fn dispatch_one_item(
    planning: &PlanningClient,
    subprocess: &AgentSubprocessClient,
    broadcaster: &StatusBroadcaster,
    flags: &RunFlags,
    cfg: &RunConfig,
    item: WorkItem,
    retry_from_scratch: bool,
    manager: &CheckpointManager,
) -> Result<String, FailedItem> {
    if retry_from_scratch {
        info!("re-dispatching {} from scratch after resume", item.identifier);
    }

    let resource_kind = match item.item_type {
        WorkItemType::Feature => ResourceKind::Feature,
        WorkItemType::Task => ResourceKind::Task,
    };

    if let Err(e) = planning.start_work(resource_kind, &item.id).await {
        return Err(FailedItem { id: item.id.clone(), error: e.to_string() });
    }

    let agent_id = uuid::Uuid::new_v4().to_string();
    let item_cwd = cfg.cwd.join(format!("work-{}", item.identifier.replace('/', "-")));

    let _ = manager
        .mark_in_progress(InProgressItem {
            id: item.id.clone(),
            identifier: item.identifier.clone(),
            agent_id: agent_id.clone(),
            progress: 0,
        })
        .await;

    broadcaster.publish(StatusEvent::AgentStarted { agent_id: agent_id.clone(), item_id: item.id.clone() });

    let options = SessionOptions {
        model: cfg.model.clone(),
        system_prompt: cfg.system_prompt.clone(),
        allowed_tools: cfg.allowed_tools.clone(),
        env: Default::default(),
        cwd: Some(item_cwd),
        overall_timeout: cfg.overall_timeout,
        inactivity_timeout: cfg.inactivity_timeout,
    };

    let session = Arc::new(AgentSession::new(subprocess, options));

    if flags.cancelled.load(Ordering::SeqCst) {
        session.cancel().await;
        return Err(FailedItem {
            id: item.id.clone(),
            error: "cancelled before dispatch".to_string(),
        });
    }

    let prompt = format!("Implement {}: {}\n\n{}", item.identifier, item.title, item.description);
    let outcome = session.send_and_wait(prompt, cfg.overall_timeout).await;

    match outcome {
        Ok(summary) => {
            if session.state().await == SessionState::Failed {
                let error = "session reported failure despite a returned result".to_string();
                broadcaster.publish(StatusEvent::ItemFailed {
                    id: item.id.clone(),
                    error_kind: ErrorKind::AgentExecution,
                    message: error.clone(),
                });
                return Err(FailedItem { id: item.id.clone(), error });
            }

            if let Err(e) = planning.complete_work(resource_kind, &item.id, Some(&summary)).await {
                return Err(FailedItem { id: item.id.clone(), error: e.to_string() });
            }
            let _ = manager.mark_completed(&item.id, &item.identifier).await;
            broadcaster.publish(StatusEvent::ItemCompleted { id: item.id.clone() });
            Ok(item.id)
        }
        Err(e) => {
            broadcaster.publish(StatusEvent::ItemFailed {
                id: item.id.clone(),
                error_kind: e.kind,
                message: e.message.clone(),
            });
            Err(FailedItem { id: item.id, error: e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_config_defaults_match_spec() {
        let cfg = RunConfig::new("epic-1", "/tmp/work");
        assert_eq!(cfg.max_agents, 1);
        assert!(cfg.resume_if_present);
        assert_eq!(cfg.on_item_failure, OnItemFailure::Continue);
    }

    #[test]
    fn cancel_and_pause_flags_are_independent() {
        let flags = RunFlags { cancelled: AtomicBool::new(false), paused: AtomicBool::new(false) };
        flags.paused.store(true, Ordering::SeqCst);
        assert!(!flags.cancelled.load(Ordering::SeqCst));
        assert!(flags.paused.load(Ordering::SeqCst));
    }
}
