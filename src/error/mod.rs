//! # Orchestration error taxonomy
//!
//! A single unified error type for the orchestration core. Unlike the
//! teacher's per-variant `ProdigyError` enum, [`OrchestraError`] is one
//! `thiserror`-derived struct carrying a closed [`ErrorKind`] so callers —
//! the retry policy (`retry`), the pool (`orchestrator`), and the checkpoint
//! manager (`checkpoint`) — can match on *kind* rather than parse messages
//! or downcast variants. Context is accumulated through
//! [`ErrorExt::context_kv`] at effect boundaries (subprocess spawn, HTTP
//! calls, file I/O) the same way `anyhow::Context` is used elsewhere in this
//! crate, but preserves the kind for classification.

use std::fmt;
use thiserror::Error;

mod codes;
pub use codes::ErrorCode;

/// Closed taxonomy of error kinds, per the propagation policy in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthMissing,
    AuthInvalid,
    AuthExpired,
    NetworkConnection,
    NetworkTimeout,
    NetworkServer,
    NetworkRateLimited,
    PlanningValidation,
    PlanningNotFound,
    PlanningConflict,
    AgentSpawn,
    AgentTimeout,
    AgentInactive,
    AgentExecution,
    CheckpointCorrupted,
    CheckpointVersionMismatch,
    CheckpointExpired,
    CheckpointIo,
    Cycle,
    Cancelled,
    Config,
}

impl ErrorKind {
    /// Whether this kind is retryable under the default classification
    /// (§4.1). Agent timeouts are a policy decision, not a hard rule, so
    /// callers that want "timeout is fatal" semantics should not rely on
    /// this and should check `ErrorKind` directly instead.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkConnection
                | ErrorKind::NetworkTimeout
                | ErrorKind::NetworkServer
                | ErrorKind::NetworkRateLimited
        )
    }

    /// Stable numeric code for logs and the status broadcaster's
    /// `ItemFailed` payload.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::AuthMissing => ErrorCode::AUTH_MISSING,
            ErrorKind::AuthInvalid => ErrorCode::AUTH_INVALID,
            ErrorKind::AuthExpired => ErrorCode::AUTH_EXPIRED,
            ErrorKind::NetworkConnection => ErrorCode::NETWORK_CONNECTION,
            ErrorKind::NetworkTimeout => ErrorCode::NETWORK_TIMEOUT,
            ErrorKind::NetworkServer => ErrorCode::NETWORK_SERVER,
            ErrorKind::NetworkRateLimited => ErrorCode::NETWORK_RATE_LIMITED,
            ErrorKind::PlanningValidation => ErrorCode::PLANNING_VALIDATION,
            ErrorKind::PlanningNotFound => ErrorCode::PLANNING_NOT_FOUND,
            ErrorKind::PlanningConflict => ErrorCode::PLANNING_CONFLICT,
            ErrorKind::AgentSpawn => ErrorCode::AGENT_SPAWN,
            ErrorKind::AgentTimeout => ErrorCode::AGENT_TIMEOUT,
            ErrorKind::AgentInactive => ErrorCode::AGENT_INACTIVE,
            ErrorKind::AgentExecution => ErrorCode::AGENT_EXECUTION,
            ErrorKind::CheckpointCorrupted => ErrorCode::CHECKPOINT_CORRUPTED,
            ErrorKind::CheckpointVersionMismatch => ErrorCode::CHECKPOINT_VERSION_MISMATCH,
            ErrorKind::CheckpointExpired => ErrorCode::CHECKPOINT_EXPIRED,
            ErrorKind::CheckpointIo => ErrorCode::CHECKPOINT_IO,
            ErrorKind::Cycle => ErrorCode::CYCLE,
            ErrorKind::Cancelled => ErrorCode::CANCELLED,
            ErrorKind::Config => ErrorCode::CONFIG,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::AuthInvalid => "auth_invalid",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::NetworkConnection => "network_connection",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkServer => "network_server",
            ErrorKind::NetworkRateLimited => "network_rate_limited",
            ErrorKind::PlanningValidation => "planning_validation",
            ErrorKind::PlanningNotFound => "planning_not_found",
            ErrorKind::PlanningConflict => "planning_conflict",
            ErrorKind::AgentSpawn => "agent_spawn",
            ErrorKind::AgentTimeout => "agent_timeout",
            ErrorKind::AgentInactive => "agent_inactive",
            ErrorKind::AgentExecution => "agent_execution",
            ErrorKind::CheckpointCorrupted => "checkpoint_corrupted",
            ErrorKind::CheckpointVersionMismatch => "checkpoint_version_mismatch",
            ErrorKind::CheckpointExpired => "checkpoint_expired",
            ErrorKind::CheckpointIo => "checkpoint_io",
            ErrorKind::Cycle => "cycle",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

/// A single context frame, accumulated outward from the failure site.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub message: String,
    pub key_values: Vec<(String, String)>,
}

/// The unified error type for the orchestration core.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct OrchestraError {
    pub kind: ErrorKind,
    pub message: String,
    pub recovery_hint: Option<String>,
    pub context: Vec<ErrorContext>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl OrchestraError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recovery_hint: None,
            context: Vec::new(),
            source: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_kv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if self.context.is_empty() {
            self.context.push(ErrorContext {
                message: String::new(),
                key_values: Vec::new(),
            });
        }
        self.context
            .last_mut()
            .unwrap()
            .key_values
            .push((key.into(), value.into()));
        self
    }

    /// Whole-run-fatal per §7: Config, AuthInvalid, AuthExpired, and
    /// CheckpointCorrupted (the latter only when the caller is resuming and
    /// has not explicitly overridden — that decision is made by the
    /// orchestrator, not this type).
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Config | ErrorKind::AuthInvalid | ErrorKind::AuthExpired
        )
    }

    pub fn developer_message(&self) -> String {
        let mut out = format!("[{} ({})] {}", self.kind, self.kind.code(), self.message);
        for ctx in &self.context {
            if !ctx.message.is_empty() {
                out.push_str(&format!("\n  context: {}", ctx.message));
            }
            for (k, v) in &ctx.key_values {
                out.push_str(&format!("\n    {k}={v}"));
            }
        }
        if let Some(source) = &self.source {
            out.push_str(&format!("\n  caused by: {source}"));
        }
        out
    }
}

/// Extension trait mirroring `anyhow::Context` but preserving `ErrorKind`.
pub trait ErrorExt<T> {
    fn context_kv(self, message: impl Into<String>) -> Result<T, OrchestraError>;
}

impl<T> ErrorExt<T> for Result<T, OrchestraError> {
    fn context_kv(self, message: impl Into<String>) -> Result<T, OrchestraError> {
        self.map_err(|mut e| {
            e.context.push(ErrorContext {
                message: message.into(),
                key_values: Vec::new(),
            });
            e
        })
    }
}

pub mod helpers {
    use super::{ErrorKind, OrchestraError};

    pub fn config(message: impl Into<String>) -> OrchestraError {
        OrchestraError::new(ErrorKind::Config, message)
    }

    pub fn agent_spawn(message: impl Into<String>) -> OrchestraError {
        OrchestraError::new(ErrorKind::AgentSpawn, message)
    }

    pub fn agent_timeout(message: impl Into<String>) -> OrchestraError {
        OrchestraError::new(ErrorKind::AgentTimeout, message)
    }

    pub fn agent_inactive(message: impl Into<String>) -> OrchestraError {
        OrchestraError::new(ErrorKind::AgentInactive, message)
    }

    pub fn cancelled() -> OrchestraError {
        OrchestraError::new(ErrorKind::Cancelled, "operation cancelled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_fatal_kinds() {
        assert!(helpers::config("bad").is_run_fatal());
        assert!(!helpers::agent_timeout("slow").is_run_fatal());
    }

    #[test]
    fn developer_message_includes_context_and_source() {
        let io_err = std::io::Error::other("disk full");
        let err = OrchestraError::new(ErrorKind::CheckpointIo, "failed to write checkpoint")
            .with_source(io_err)
            .with_kv("path", "/tmp/checkpoint.json");
        let msg = err.developer_message();
        assert!(msg.contains("checkpoint_io"));
        assert!(msg.contains("disk full"));
        assert!(msg.contains("path=/tmp/checkpoint.json"));
    }

    #[test]
    fn default_retryable_matches_network_kinds_only() {
        assert!(ErrorKind::NetworkTimeout.default_retryable());
        assert!(ErrorKind::NetworkServer.default_retryable());
        assert!(ErrorKind::NetworkRateLimited.default_retryable());
        assert!(!ErrorKind::AuthInvalid.default_retryable());
        assert!(!ErrorKind::AgentSpawn.default_retryable());
    }
}
