//! Agent Session (C4) — a conversational handle over the subprocess client,
//! tracking state and fanning out events to one broadcast consumer.
//!
//! Grounded in the teacher's production/mock subprocess manager split
//! (`subprocess::mod::SubprocessManager`) for the "session owns its own
//! client copy" idea, generalized here into per-session option overrides
//! rather than swapping implementations.

use super::subprocess::{AgentEvent, AgentSubprocessClient, ExecuteOptions, ExecuteResult};
use crate::error::{ErrorKind, OrchestraError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info};

const DEFAULT_SEND_AND_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The session's lifecycle state (§4.4). `Completed`/`Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Working,
    Completed,
    Failed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// Per-session overrides applied on top of the shared client (§4.4).
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub overall_timeout: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

impl SessionOptions {
    fn to_execute_options(&self) -> ExecuteOptions {
        let mut opts = ExecuteOptions::new();
        opts.model = self.model.clone();
        opts.system_prompt = self.system_prompt.clone();
        opts.allowed_tools = self.allowed_tools.clone();
        opts.env = self.env.clone();
        opts.cwd = self.cwd.clone();
        opts.overall_timeout = self.overall_timeout;
        opts.inactivity_timeout = self.inactivity_timeout;
        opts
    }
}

struct Inner {
    state: SessionState,
    last_content: String,
    running: Option<AbortHandle>,
}

/// Wraps [`AgentSubprocessClient`] behind a conversational state machine.
/// Holds a session-local copy of the client (with the session's env
/// overlay baked in) so per-session overrides never affect sibling
/// sessions sharing the same pool-level client.
pub struct AgentSession {
    client: AgentSubprocessClient,
    options: SessionOptions,
    inner: Mutex<Inner>,
    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
}

impl AgentSession {
    pub fn new(client: &AgentSubprocessClient, options: SessionOptions) -> Self {
        let session_client = client.with_overlay(options.env.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client: session_client,
            options,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                last_content: String::new(),
                running: None,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes ownership of the event receiver; a session yields at most one
    /// consumer, matching the single status-broadcaster fan-out per item.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn last_content(&self) -> String {
        self.inner.lock().await.last_content.clone()
    }

    /// `idle -> working` on send; fails if already `working` or terminal.
    async fn begin_send(&self) -> Result<(), OrchestraError> {
        let mut guard = self.inner.lock().await;
        match guard.state {
            SessionState::Idle => {
                guard.state = SessionState::Working;
                Ok(())
            }
            SessionState::Working => Err(OrchestraError::new(
                ErrorKind::AgentExecution,
                "session already has a prompt in flight",
            )),
            SessionState::Completed | SessionState::Failed => Err(OrchestraError::new(
                ErrorKind::AgentExecution,
                "session is terminal; create a new session to send again",
            )),
        }
    }

    async fn settle(&self, outcome: &Result<ExecuteResult, OrchestraError>) {
        let mut guard = self.inner.lock().await;
        if guard.state.is_terminal() {
            return;
        }
        guard.running = None;
        guard.state = match outcome {
            Ok(result) => {
                guard.last_content = result.result.clone();
                SessionState::Completed
            }
            Err(_) => SessionState::Failed,
        };
    }

    /// Fire-and-forget send: spawns the prompt and returns immediately,
    /// driving the subprocess to completion in the background. Errors are
    /// only observable through the event channel and final state.
    pub async fn send(self: &std::sync::Arc<Self>, prompt: impl Into<String>) -> Result<(), OrchestraError> {
        self.begin_send().await?;
        let prompt = prompt.into();
        let this = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = this.run_prompt(prompt).await;
        });
        self.inner.lock().await.running = Some(handle.abort_handle());
        Ok(())
    }

    /// Runs the prompt to completion, races the overall timeout, resolves on
    /// `complete`/first `error`, and settles session state either way.
    pub async fn send_and_wait(
        self: &std::sync::Arc<Self>,
        prompt: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<String, OrchestraError> {
        self.begin_send().await?;
        let prompt = prompt.into();
        let timeout = timeout.unwrap_or_else(|| {
            self.options
                .overall_timeout
                .unwrap_or(DEFAULT_SEND_AND_WAIT_TIMEOUT)
        });

        let this = std::sync::Arc::clone(self);
        let run = tokio::spawn(async move { this.run_prompt(prompt).await });
        let abort_handle = run.abort_handle();
        self.inner.lock().await.running = Some(abort_handle.clone());

        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OrchestraError::new(
                ErrorKind::AgentExecution,
                format!("session task panicked: {join_err}"),
            )),
            Err(_) => {
                abort_handle.abort();
                Err(OrchestraError::new(
                    ErrorKind::AgentTimeout,
                    "sendAndWait exceeded its timeout",
                ))
            }
        };

        self.settle(&outcome).await;
        outcome.map(|r| r.result)
    }

    async fn run_prompt(&self, prompt: String) -> Result<ExecuteResult, OrchestraError> {
        let opts = self.options.to_execute_options();
        let outcome = self.client.execute_prompt(&prompt, &opts, self.events_tx.clone()).await;

        self.settle(&outcome).await;
        debug!(state = ?self.state().await, "session prompt settled");
        outcome
    }

    /// Requests cancellation: aborts the in-flight task (dropping its
    /// `execute_prompt` future, which kills the child via `kill_on_drop`)
    /// and transitions to `failed` if not already terminal.
    pub async fn cancel(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.running.take() {
            handle.abort();
        }
        if !guard.state.is_terminal() {
            guard.state = SessionState::Failed;
            info!("session cancelled");
        }
    }

    /// Tears down the session; terminal states are a no-op, a working
    /// session is cancelled first.
    pub async fn destroy(&self) {
        self.cancel().await;
    }
}
