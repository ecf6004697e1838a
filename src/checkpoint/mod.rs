//! Checkpoint Manager (C7) — durable, versioned run state with atomic
//! writes and validated loads.
//!
//! Grounded in the teacher's `cook::execution::mapreduce::state::checkpoint`
//! (versioned checkpoints, checksum-style validation) and
//! `cook::workflow::checkpoint` (atomic temp-file-then-rename persistence).
//! Unlike the teacher's in-process `StateManager`, this manager owns exactly
//! one file per run, matching spec.md §4.7/§6.

use crate::error::{ErrorKind, OrchestraError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current schema major version. Bumped whenever a field is removed or its
/// meaning changes in an incompatible way.
pub const CHECKPOINT_VERSION: &str = "1.0.0";

const DEFAULT_STATE_DIR: &str = ".spectree";
const DEFAULT_FILENAME: &str = "checkpoint.json";
const DEFAULT_MAX_AGE: chrono::Duration = chrono::Duration::days(7);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InProgressItem {
    pub id: String,
    pub identifier: String,
    pub agent_id: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointError {
    pub kind: String,
    pub message: String,
}

/// The durable `ExecutionState` snapshot (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: String,
    pub epic_id: String,
    pub epic_identifier: String,
    pub session_id: String,
    pub git_branch: String,
    pub base_branch: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub total_phases: u32,
    pub current_phase: u32,
    #[serde(default)]
    pub completed_items: HashSet<String>,
    #[serde(default)]
    pub completed_identifiers: HashSet<String>,
    #[serde(default)]
    pub in_progress_items: Vec<InProgressItem>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub error: Option<CheckpointError>,
    #[serde(default)]
    pub paused: bool,
}

impl Checkpoint {
    pub fn new(epic_id: impl Into<String>, epic_identifier: impl Into<String>, session_id: impl Into<String>, git_branch: impl Into<String>, cwd: PathBuf, total_phases: u32) -> Self {
        let now = Utc::now();
        Self {
            version: CHECKPOINT_VERSION.to_string(),
            epic_id: epic_id.into(),
            epic_identifier: epic_identifier.into(),
            session_id: session_id.into(),
            git_branch: git_branch.into(),
            base_branch: None,
            cwd,
            metadata: HashMap::new(),
            total_phases,
            current_phase: 0,
            completed_items: HashSet::new(),
            completed_identifiers: HashSet::new(),
            in_progress_items: Vec::new(),
            started_at: now,
            last_updated: now,
            error: None,
            paused: false,
        }
    }
}

/// Why a load did not return a usable state (§4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadReason {
    NotFound,
    Corrupted,
    InvalidFormat(String),
    VersionMismatch { found: String, expected: String },
    Expired,
}

impl std::fmt::Display for LoadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadReason::NotFound => write!(f, "not_found"),
            LoadReason::Corrupted => write!(f, "corrupted"),
            LoadReason::InvalidFormat(field) => write!(f, "invalid_format: missing {field}"),
            LoadReason::VersionMismatch { found, expected } => {
                write!(f, "version_mismatch: found {found}, expected major {expected}")
            }
            LoadReason::Expired => write!(f, "expired"),
        }
    }
}

/// Result of [`CheckpointManager::load`].
pub struct LoadResult {
    pub state: Option<Checkpoint>,
    pub reason: Option<LoadReason>,
}

/// `{phase, skip_items, retry_items}` derived from a loaded checkpoint
/// (§4.7).
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub phase: u32,
    pub skip_items: HashSet<String>,
    pub retry_items: Vec<String>,
}

pub fn find_resume_point(state: &Checkpoint) -> ResumePoint {
    ResumePoint {
        phase: state.current_phase,
        skip_items: state.completed_items.clone(),
        retry_items: state.in_progress_items.iter().map(|i| i.id.clone()).collect(),
    }
}

/// Owns the single checkpoint file for a run.
pub struct CheckpointManager {
    path: PathBuf,
    max_age: chrono::Duration,
    lock: tokio::sync::Mutex<()>,
}

impl CheckpointManager {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self::with_filename(state_dir, DEFAULT_FILENAME)
    }

    pub fn with_filename(state_dir: impl AsRef<Path>, filename: &str) -> Self {
        Self {
            path: state_dir.as_ref().join(filename),
            max_age: DEFAULT_MAX_AGE,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The default location, `.spectree/checkpoint.json` under `cwd`.
    pub fn default_in(cwd: impl AsRef<Path>) -> Self {
        Self::new(cwd.as_ref().join(DEFAULT_STATE_DIR))
    }

    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize and atomically persist `state`: write to a sibling
    /// `.tmp` file, fsync, then rename over the destination. `save` always
    /// stamps `last_updated` and the current schema version.
    pub async fn save(&self, mut state: Checkpoint) -> Result<(), OrchestraError> {
        let _guard = self.lock.lock().await;
        state.last_updated = Utc::now();
        state.version = CHECKPOINT_VERSION.to_string();

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestraError::new(ErrorKind::CheckpointIo, "failed to create checkpoint directory")
                    .with_source(e)
            })?;
        }

        let json = serde_json::to_vec_pretty(&state).map_err(|e| {
            OrchestraError::new(ErrorKind::CheckpointIo, "failed to serialize checkpoint").with_source(e)
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
                OrchestraError::new(ErrorKind::CheckpointIo, "failed to create checkpoint temp file")
                    .with_source(e)
            })?;
            use tokio::io::AsyncWriteExt;
            file.write_all(&json).await.map_err(|e| {
                OrchestraError::new(ErrorKind::CheckpointIo, "failed to write checkpoint temp file")
                    .with_source(e)
            })?;
            file.sync_all().await.map_err(|e| {
                OrchestraError::new(ErrorKind::CheckpointIo, "failed to fsync checkpoint temp file")
                    .with_source(e)
            })?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            OrchestraError::new(ErrorKind::CheckpointIo, "failed to rename checkpoint into place")
                .with_source(e)
        })?;

        debug!("checkpoint saved: phase={} completed={}", state.current_phase, state.completed_items.len());
        Ok(())
    }

    /// Never throws: returns a `reason` instead of an error on any problem.
    pub async fn load(&self) -> LoadResult {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return LoadResult { state: None, reason: Some(LoadReason::NotFound) };
            }
            Err(_) => {
                return LoadResult { state: None, reason: Some(LoadReason::Corrupted) };
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(_) => {
                warn!("checkpoint file at {:?} is not valid JSON", self.path);
                return LoadResult { state: None, reason: Some(LoadReason::Corrupted) };
            }
        };

        for field in [
            "version", "epicId", "epicIdentifier", "sessionId", "gitBranch", "cwd",
            "totalPhases", "currentPhase", "startedAt", "lastUpdated",
        ] {
            if value.get(field).is_none() {
                return LoadResult {
                    state: None,
                    reason: Some(LoadReason::InvalidFormat(field.to_string())),
                };
            }
        }

        let state: Checkpoint = match serde_json::from_value(value) {
            Ok(s) => s,
            Err(e) => {
                return LoadResult {
                    state: None,
                    reason: Some(LoadReason::InvalidFormat(e.to_string())),
                };
            }
        };

        let current_major = major_version(CHECKPOINT_VERSION);
        let found_major = major_version(&state.version);
        if found_major != current_major {
            return LoadResult {
                state: None,
                reason: Some(LoadReason::VersionMismatch {
                    found: state.version.clone(),
                    expected: current_major.to_string(),
                }),
            };
        }

        let age = Utc::now().signed_duration_since(state.last_updated);
        if age > self.max_age {
            return LoadResult { state: None, reason: Some(LoadReason::Expired) };
        }

        info!("loaded checkpoint: phase={}/{} completed={}", state.current_phase, state.total_phases, state.completed_items.len());
        LoadResult { state: Some(state), reason: None }
    }

    pub async fn has_valid(&self) -> bool {
        self.load().await.state.is_some()
    }

    pub async fn clear(&self) -> Result<(), OrchestraError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestraError::new(ErrorKind::CheckpointIo, "failed to remove checkpoint").with_source(e)),
        }
    }

    /// Load, apply `patch`, and save. Returns the updated state, or `None`
    /// if there was nothing valid to update.
    pub async fn update(
        &self,
        patch: impl FnOnce(&mut Checkpoint),
    ) -> Result<Option<Checkpoint>, OrchestraError> {
        let Some(mut state) = self.load().await.state else {
            return Ok(None);
        };
        patch(&mut state);
        self.save(state.clone()).await?;
        Ok(Some(state))
    }

    /// Idempotent: repeated calls with the same id do not duplicate it.
    pub async fn mark_completed(&self, id: &str, identifier: &str) -> Result<Option<Checkpoint>, OrchestraError> {
        let id = id.to_string();
        let identifier = identifier.to_string();
        self.update(move |state| {
            state.completed_items.insert(id.clone());
            state.completed_identifiers.insert(identifier.clone());
            state.in_progress_items.retain(|item| item.id != id);
        })
        .await
    }

    pub async fn mark_in_progress(&self, item: InProgressItem) -> Result<Option<Checkpoint>, OrchestraError> {
        self.update(move |state| {
            state.in_progress_items.retain(|existing| existing.id != item.id);
            state.in_progress_items.push(item.clone());
        })
        .await
    }

    pub async fn save_error_state(&self, kind: ErrorKind, message: impl Into<String>, paused: bool) -> Result<Option<Checkpoint>, OrchestraError> {
        let message = message.into();
        self.update(move |state| {
            state.error = Some(CheckpointError { kind: kind.to_string(), message: message.clone() });
            state.paused = paused;
        })
        .await
    }

    pub async fn get_info(&self) -> LoadResult {
        self.load().await
    }
}

fn major_version(v: &str) -> u64 {
    semver::Version::parse(v).map(|v| v.major).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;

    fn sample(cwd: PathBuf) -> Checkpoint {
        Checkpoint::new("epic-1", "ENG-1", "sess-1", "feature/x", cwd, 3)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        let state = sample(dir.path().to_path_buf());
        mgr.save(state.clone()).await.unwrap();

        let loaded = mgr.load().await;
        assert!(loaded.reason.is_none());
        let loaded = loaded.state.unwrap();
        assert_eq!(loaded.epic_id, state.epic_id);
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert!(loaded.last_updated >= state.started_at);
    }

    #[tokio::test]
    async fn missing_file_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        let result = mgr.load().await;
        assert_eq!(result.reason, Some(LoadReason::NotFound));
    }

    #[tokio::test]
    async fn corrupted_file_is_detected_not_crashed_on() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        tokio::fs::create_dir_all(dir.path().join(".spectree")).await.unwrap();
        tokio::fs::write(mgr.path(), b"not json at all {{{").await.unwrap();

        let result = mgr.load().await;
        assert_eq!(result.reason, Some(LoadReason::Corrupted));
        assert!(result.state.is_none());
        // corrupted file is left in place for inspection.
        assert!(mgr.path().exists());
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        tokio::fs::create_dir_all(dir.path().join(".spectree")).await.unwrap();
        tokio::fs::write(mgr.path(), br#"{"version":"1.0.0"}"#).await.unwrap();

        let result = mgr.load().await;
        matches!(result.reason, Some(LoadReason::InvalidFormat(_)));
        assert!(result.state.is_none());
    }

    #[tokio::test]
    async fn version_major_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        let mut state = sample(dir.path().to_path_buf());
        state.version = "2.0.0".to_string();
        let json = serde_json::to_vec_pretty(&state).unwrap();
        tokio::fs::create_dir_all(dir.path().join(".spectree")).await.unwrap();
        tokio::fs::write(mgr.path(), json).await.unwrap();

        let result = mgr.load().await;
        assert!(matches!(result.reason, Some(LoadReason::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn expired_checkpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path()).with_max_age(chrono::Duration::seconds(0));
        let mut state = sample(dir.path().to_path_buf());
        state.last_updated = Utc::now() - chrono::Duration::days(1);
        let json = serde_json::to_vec_pretty(&state).unwrap();
        tokio::fs::create_dir_all(dir.path().join(".spectree")).await.unwrap();
        tokio::fs::write(mgr.path(), json).await.unwrap();

        let result = mgr.load().await;
        assert_eq!(result.reason, Some(LoadReason::Expired));
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        mgr.save(sample(dir.path().to_path_buf())).await.unwrap();

        mgr.mark_completed("item-1", "ENG-1-1").await.unwrap();
        mgr.mark_completed("item-1", "ENG-1-1").await.unwrap();

        let state = mgr.load().await.state.unwrap();
        assert_eq!(state.completed_items.len(), 1);
        assert_eq!(state.completed_identifiers.len(), 1);
    }

    #[tokio::test]
    async fn completed_and_in_progress_are_disjoint_after_mark_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        mgr.save(sample(dir.path().to_path_buf())).await.unwrap();

        mgr.mark_in_progress(InProgressItem {
            id: "item-1".into(),
            identifier: "ENG-1-1".into(),
            agent_id: "agent-1".into(),
            progress: 40,
        })
        .await
        .unwrap();
        mgr.mark_completed("item-1", "ENG-1-1").await.unwrap();

        let state = mgr.load().await.state.unwrap();
        let in_progress_ids: Set<String> = state.in_progress_items.iter().map(|i| i.id.clone()).collect();
        assert!(state.completed_items.is_disjoint(&in_progress_ids));
    }

    #[tokio::test]
    async fn resume_point_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        let mut state = sample(dir.path().to_path_buf());
        state.current_phase = 2;
        state.completed_items.insert("a".to_string());
        state.in_progress_items.push(InProgressItem {
            id: "b".into(),
            identifier: "ENG-1-2".into(),
            agent_id: "agent-1".into(),
            progress: 10,
        });
        mgr.save(state.clone()).await.unwrap();

        let resume = find_resume_point(&state);
        assert_eq!(resume.phase, 2);
        assert!(resume.skip_items.contains("a"));
        assert_eq!(resume.retry_items, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn clear_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CheckpointManager::default_in(dir.path());
        mgr.save(sample(dir.path().to_path_buf())).await.unwrap();
        mgr.clear().await.unwrap();
        assert!(!mgr.path().exists());
        // second clear on an already-absent file must not error.
        mgr.clear().await.unwrap();
    }
}
