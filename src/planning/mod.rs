//! Planning Client (C2) — a typed HTTP client for the planning service
//! (epics/features/tasks CRUD, sessions, progress), wrapping every call in
//! [`crate::retry`].
//!
//! Grounded in the teacher's typed-client conventions: a single shared
//! `reqwest::Client`, bearer auth, JSON envelopes, and every network call
//! routed through the retry policy rather than called bare. The planning
//! service itself is an external collaborator (spec.md §1); this module
//! only models its wire shape and client surface.

use crate::error::{ErrorKind, OrchestraError};
use crate::model::{Complexity, ExecutionPlan, WorkItem, WorkItemType};
use crate::retry::{self, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const API_SUFFIX: &str = "/api/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("orchestra-core/", env!("CARGO_PKG_VERSION"));

/// Envelope for single-resource responses: `{data: T}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Envelope for paginated list responses: `{data: T[], meta:{cursor, hasMore}}`.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    pub cursor: Option<String>,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

/// A closed status category, per the JSON-anchored-enums note in spec.md §9:
/// unrecognised strings land in `Unknown` rather than failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Backlog,
    Started,
    Completed,
    Canceled,
    Unstarted,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Status {
    pub id: String,
    pub name: String,
    pub category: StatusCategory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Epic {
    pub id: String,
    pub identifier: String,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub id: String,
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status_ref: Option<String>,
    #[serde(default)]
    pub assignee_ref: Option<String>,
    #[serde(default)]
    pub execution_order: Option<i64>,
    #[serde(default)]
    pub can_parallelize: bool,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_complexity: Option<Complexity>,
    pub created_at: String,
}

impl From<FeatureRecord> for WorkItem {
    fn from(f: FeatureRecord) -> Self {
        let mut item = WorkItem::new(f.id, f.identifier, WorkItemType::Feature)
            .depends_on(f.dependencies);
        item.title = f.title;
        item.description = f.description;
        item.status_ref = f.status_ref;
        item.assignee_ref = f.assignee_ref;
        item.execution_order = f.execution_order;
        item.can_parallelize = f.can_parallelize;
        item.parallel_group = f.parallel_group;
        if let Some(c) = f.estimated_complexity {
            item.estimated_complexity = Some(c);
        }
        item
    }
}

/// Mirrors `FeatureRecord`; tasks and features share a wire shape from the
/// core's point of view (both are WorkItems, per the glossary).
pub type TaskRecord = FeatureRecord;

#[derive(Debug, Clone, Serialize)]
pub struct CombinedSearchResult {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub item_type: WorkItemType,
    pub created_at: String,
}

/// An opaque composite cursor over two independent paginated list calls, per
/// spec.md §4.2's search contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCursor {
    Combined { feature: Option<String>, task: Option<String> },
    Feature(String),
    Task(String),
}

impl SearchCursor {
    pub fn encode(&self) -> String {
        match self {
            SearchCursor::Combined { feature, task } => format!(
                "combined:{}|{}",
                feature.as_deref().unwrap_or(""),
                task.as_deref().unwrap_or("")
            ),
            SearchCursor::Feature(c) => format!("feature:{c}"),
            SearchCursor::Task(c) => format!("task:{c}"),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, OrchestraError> {
        if let Some(rest) = raw.strip_prefix("combined:") {
            let (feat, task) = rest.split_once('|').ok_or_else(|| {
                OrchestraError::new(ErrorKind::PlanningValidation, "malformed combined cursor")
            })?;
            return Ok(SearchCursor::Combined {
                feature: (!feat.is_empty()).then(|| feat.to_string()),
                task: (!task.is_empty()).then(|| task.to_string()),
            });
        }
        if let Some(rest) = raw.strip_prefix("feature:") {
            return Ok(SearchCursor::Feature(rest.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("task:") {
            return Ok(SearchCursor::Task(rest.to_string()));
        }
        Err(OrchestraError::new(ErrorKind::PlanningValidation, "unrecognised cursor prefix"))
    }
}

/// `startWork`/`completeWork` resource discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Feature,
    Task,
}

impl ResourceKind {
    fn path_segment(self) -> &'static str {
        match self {
            ResourceKind::Feature => "features",
            ResourceKind::Task => "tasks",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    pub id: String,
    #[serde(rename = "epicId")]
    pub epic_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_items: usize,
    pub completed_items: usize,
    pub percent_complete: f64,
}

/// Typed client for the planning service (C2). Holds one shared
/// `reqwest::Client`, safe for concurrent use across workers (§5).
pub struct PlanningClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl PlanningClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, OrchestraError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| OrchestraError::new(ErrorKind::Config, "failed to build HTTP client").with_source(e))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url.trim_end_matches('/'), API_SUFFIX, path)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, OrchestraError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_http_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| OrchestraError::new(ErrorKind::PlanningValidation, "unparseable response body").with_source(e))
    }

    async fn get_with_retry<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, OrchestraError> {
        let cfg = RetryConfig::read_operation_profile();
        retry::with_retry(&cfg, &format!("GET {path}"), || async {
            self.send_json(self.http.get(self.url(path))).await
        })
        .await
    }

    async fn write_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        description: &str,
        request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<T, OrchestraError> {
        let cfg = RetryConfig::default_profile();
        retry::with_retry(&cfg, description, || async { self.send_json(request()).await }).await
    }

    // --- Epics -----------------------------------------------------------

    pub async fn get_epic(&self, id_or_identifier: &str) -> Result<Epic, OrchestraError> {
        let env: Envelope<Epic> = self.get_with_retry(&format!("/epics/{id_or_identifier}")).await?;
        Ok(env.data)
    }

    pub async fn list_epics(&self, cursor: Option<&str>) -> Result<Page<Epic>, OrchestraError> {
        let path = match cursor {
            Some(c) => format!("/epics?cursor={c}"),
            None => "/epics".to_string(),
        };
        self.get_with_retry(&path).await
    }

    pub async fn archive_epic(&self, id: &str) -> Result<(), OrchestraError> {
        let url = self.url(&format!("/epics/{id}/archive"));
        let _: Envelope<Value> = self
            .write_with_retry("archive epic", || self.http.post(&url))
            .await?;
        Ok(())
    }

    // --- Features / Tasks -------------------------------------------------

    pub async fn list_features(&self, epic_id: &str, cursor: Option<&str>) -> Result<Page<FeatureRecord>, OrchestraError> {
        let mut path = format!("/features?epicId={epic_id}");
        if let Some(c) = cursor {
            path.push_str(&format!("&cursor={c}"));
        }
        self.get_with_retry(&path).await
    }

    pub async fn list_tasks(&self, epic_id: &str, cursor: Option<&str>) -> Result<Page<TaskRecord>, OrchestraError> {
        let mut path = format!("/tasks?epicId={epic_id}");
        if let Some(c) = cursor {
            path.push_str(&format!("&cursor={c}"));
        }
        self.get_with_retry(&path).await
    }

    pub async fn get_feature(&self, id_or_identifier: &str) -> Result<FeatureRecord, OrchestraError> {
        let env: Envelope<FeatureRecord> = self.get_with_retry(&format!("/features/{id_or_identifier}")).await?;
        Ok(env.data)
    }

    /// Composite search merging features and tasks, sorted by `createdAt`
    /// descending and truncated to `limit` (§4.2).
    pub async fn search(
        &self,
        epic_id: &str,
        cursor: Option<SearchCursor>,
        limit: usize,
    ) -> Result<(Vec<CombinedSearchResult>, Option<SearchCursor>), OrchestraError> {
        let (feature_cursor, task_cursor) = match &cursor {
            Some(SearchCursor::Combined { feature, task }) => (feature.clone(), task.clone()),
            Some(SearchCursor::Feature(c)) => (Some(c.clone()), None),
            Some(SearchCursor::Task(c)) => (None, Some(c.clone())),
            None => (None, None),
        };

        let features = self.list_features(epic_id, feature_cursor.as_deref()).await?;
        let tasks = self.list_tasks(epic_id, task_cursor.as_deref()).await?;

        let mut merged: Vec<CombinedSearchResult> = features
            .data
            .into_iter()
            .map(|f| CombinedSearchResult {
                id: f.id,
                identifier: f.identifier,
                title: f.title,
                item_type: WorkItemType::Feature,
                created_at: f.created_at,
            })
            .chain(tasks.data.into_iter().map(|t| CombinedSearchResult {
                id: t.id,
                identifier: t.identifier,
                title: t.title,
                item_type: WorkItemType::Task,
                created_at: t.created_at,
            }))
            .collect();

        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merged.truncate(limit);

        let next_cursor = match (features.meta.has_more, tasks.meta.has_more) {
            (false, false) => None,
            (true, false) => Some(SearchCursor::Feature(features.meta.cursor.unwrap_or_default())),
            (false, true) => Some(SearchCursor::Task(tasks.meta.cursor.unwrap_or_default())),
            (true, true) => Some(SearchCursor::Combined {
                feature: features.meta.cursor,
                task: tasks.meta.cursor,
            }),
        };

        Ok((merged, next_cursor))
    }

    // --- Statuses ----------------------------------------------------------

    pub async fn list_statuses(&self, team_id: &str) -> Result<Vec<Status>, OrchestraError> {
        let env: Envelope<Vec<Status>> = self.get_with_retry(&format!("/statuses?teamId={team_id}")).await?;
        Ok(env.data)
    }

    /// Resolve a name or UUID against the given scope's status list,
    /// case-insensitively (§4.2).
    pub fn resolve_status<'a>(statuses: &'a [Status], name_or_id: &str) -> Option<&'a Status> {
        statuses
            .iter()
            .find(|s| s.id == name_or_id || s.name.eq_ignore_ascii_case(name_or_id))
    }

    // --- Progress / work lifecycle ------------------------------------------

    pub async fn start_work(&self, kind: ResourceKind, id: &str) -> Result<(), OrchestraError> {
        let url = self.url(&format!("/{}/{id}/progress/start", kind.path_segment()));
        let _: Envelope<Value> = self.write_with_retry("startWork", || self.http.post(&url)).await?;
        Ok(())
    }

    pub async fn complete_work(
        &self,
        kind: ResourceKind,
        id: &str,
        summary: Option<&str>,
    ) -> Result<(), OrchestraError> {
        let url = self.url(&format!("/{}/{id}/progress/complete", kind.path_segment()));
        let body = serde_json::json!({ "summary": summary });
        let _: Envelope<Value> = self
            .write_with_retry("completeWork", || self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    pub async fn get_progress_summary(&self, epic_id: &str) -> Result<ProgressSummary, OrchestraError> {
        let env: Envelope<ProgressSummary> =
            self.get_with_retry(&format!("/epics/{epic_id}/progress-summary")).await?;
        Ok(env.data)
    }

    // --- Sessions ------------------------------------------------------------

    pub async fn start_session(&self, epic_id: &str) -> Result<ActiveSession, OrchestraError> {
        let url = self.url("/sessions/start");
        let body = serde_json::json!({ "epicId": epic_id });
        let env: Envelope<ActiveSession> = self
            .write_with_retry("startSession", || self.http.post(&url).json(&body))
            .await?;
        Ok(env.data)
    }

    pub async fn end_session(&self, epic_id: &str, summary: &str, next_steps: &str) -> Result<(), OrchestraError> {
        let url = self.url(&format!("/sessions/{epic_id}/end"));
        let body = serde_json::json!({ "summary": summary, "nextSteps": next_steps });
        let _: Envelope<Value> = self
            .write_with_retry("endSession", || self.http.post(&url).json(&body))
            .await?;
        Ok(())
    }

    pub async fn get_active_session(&self, epic_id: &str) -> Result<Option<ActiveSession>, OrchestraError> {
        let path = format!("/sessions/{epic_id}/active");
        match self.get_with_retry::<Envelope<ActiveSession>>(&path).await {
            Ok(env) => Ok(Some(env.data)),
            Err(e) if e.kind == ErrorKind::PlanningNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    // --- Execution plan ------------------------------------------------------

    /// Fetch the execution plan. Falls back to computing it locally from
    /// the feature list, per spec.md §4.2, when the remote endpoint fails
    /// with a retryable network error (not on 4xx, which is authoritative).
    pub async fn get_execution_plan(&self, epic_id: &str) -> Result<ExecutionPlan, OrchestraError> {
        let cfg = RetryConfig::read_operation_profile();
        let remote = retry::with_retry(&cfg, "getExecutionPlan", || async {
            self.send_json::<Envelope<ExecutionPlan>>(self.http.get(self.url(&format!("/epics/{epic_id}/plan"))))
                .await
        })
        .await;

        match remote {
            Ok(env) => Ok(env.data),
            Err(e)
                if matches!(
                    e.kind,
                    ErrorKind::NetworkConnection
                        | ErrorKind::NetworkTimeout
                        | ErrorKind::NetworkServer
                        | ErrorKind::NetworkRateLimited
                ) =>
            {
                self.compute_plan_locally(epic_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn compute_plan_locally(&self, epic_id: &str) -> Result<ExecutionPlan, OrchestraError> {
        let mut items = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.list_features(epic_id, cursor.as_deref()).await?;
            items.extend(page.data.into_iter().map(WorkItem::from));
            if !page.meta.has_more {
                break;
            }
            cursor = page.meta.cursor;
        }
        Ok(crate::planner::plan(items))
    }
}

fn classify_transport_error(e: reqwest::Error) -> OrchestraError {
    let kind = if e.is_timeout() {
        ErrorKind::NetworkTimeout
    } else if e.is_connect() {
        ErrorKind::NetworkConnection
    } else {
        ErrorKind::NetworkConnection
    };
    OrchestraError::new(kind, "planning service request failed").with_source(e)
}

fn classify_http_error(status: reqwest::StatusCode, body: &str) -> OrchestraError {
    let message = extract_message(body).unwrap_or_else(|| format!("HTTP {status}"));
    let kind = match status.as_u16() {
        401 => ErrorKind::AuthInvalid,
        403 => ErrorKind::AuthInvalid,
        404 => ErrorKind::PlanningNotFound,
        409 => ErrorKind::PlanningConflict,
        400 | 422 => ErrorKind::PlanningValidation,
        429 => ErrorKind::NetworkRateLimited,
        500..=599 => ErrorKind::NetworkServer,
        _ => ErrorKind::PlanningValidation,
    };
    OrchestraError::new(kind, message).with_kv("status", status.as_u16().to_string())
}

/// `body.error.message | body.message | body.error | HTTP <status>` (§4.2).
fn extract_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if let Some(m) = value.pointer("/error/message").and_then(Value::as_str) {
        return Some(m.to_string());
    }
    if let Some(m) = value.get("message").and_then(Value::as_str) {
        return Some(m.to_string());
    }
    if let Some(m) = value.get("error").and_then(Value::as_str) {
        return Some(m.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_cursor_round_trips() {
        let c = SearchCursor::Combined {
            feature: Some("f1".to_string()),
            task: Some("t1".to_string()),
        };
        let encoded = c.encode();
        assert_eq!(encoded, "combined:f1|t1");
        assert_eq!(SearchCursor::decode(&encoded).unwrap(), c);

        let c = SearchCursor::Feature("abc".to_string());
        assert_eq!(SearchCursor::decode(&c.encode()).unwrap(), c);
    }

    #[test]
    fn combined_cursor_with_empty_half_decodes_to_none() {
        let decoded = SearchCursor::decode("combined:f1|").unwrap();
        assert_eq!(
            decoded,
            SearchCursor::Combined { feature: Some("f1".to_string()), task: None }
        );
    }

    #[test]
    fn extract_message_prefers_nested_error_message() {
        let body = r#"{"error":{"message":"not found","code":"E404"}}"#;
        assert_eq!(extract_message(body).unwrap(), "not found");
    }

    #[test]
    fn extract_message_falls_back_to_top_level_message() {
        let body = r#"{"message":"bad request"}"#;
        assert_eq!(extract_message(body).unwrap(), "bad request");
    }

    #[test]
    fn classify_http_error_maps_status_codes() {
        assert_eq!(classify_http_error(reqwest::StatusCode::UNAUTHORIZED, "{}").kind, ErrorKind::AuthInvalid);
        assert_eq!(classify_http_error(reqwest::StatusCode::NOT_FOUND, "{}").kind, ErrorKind::PlanningNotFound);
        assert_eq!(classify_http_error(reqwest::StatusCode::CONFLICT, "{}").kind, ErrorKind::PlanningConflict);
        assert_eq!(classify_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}").kind, ErrorKind::NetworkRateLimited);
        assert_eq!(classify_http_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "{}").kind, ErrorKind::NetworkServer);
    }

    #[test]
    fn resolve_status_is_case_insensitive() {
        let statuses = vec![
            Status { id: "s1".to_string(), name: "In Progress".to_string(), category: StatusCategory::Started },
        ];
        assert!(PlanningClient::resolve_status(&statuses, "in progress").is_some());
        assert!(PlanningClient::resolve_status(&statuses, "s1").is_some());
        assert!(PlanningClient::resolve_status(&statuses, "nope").is_none());
    }

    #[test]
    fn unknown_status_category_parses_to_unknown_variant() {
        let raw = r#"{"id":"s1","name":"weird","category":"something_new"}"#;
        let status: Status = serde_json::from_str(raw).unwrap();
        assert_eq!(status.category, StatusCategory::Unknown);
    }
}
