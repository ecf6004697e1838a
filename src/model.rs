//! Core data model shared by the planner, pool, and checkpoint manager (§3).
//!
//! `WorkItem` is deliberately thin: it is the orchestration core's view of a
//! feature or task, not the planning service's full record. Fields the core
//! never reads (descriptions, assignees beyond a reference id) are kept as
//! opaque strings rather than typed out, the way the teacher's
//! `cook::execution::mapreduce::AgentResult` keeps output as a raw string
//! instead of parsing agent-specific structure.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Either a feature or a task; both are dispatched identically by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    Feature,
    Task,
}

/// Closed complexity scale; unknown/absent complexity is `None` at the
/// `Option<Complexity>` level, not a variant here, so max-of-phase logic
/// doesn't have to special-case an `Unknown` that sorts nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

/// One unit of work dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub identifier: String,
    pub item_type: WorkItemType,
    pub title: String,
    pub description: String,
    pub status_ref: Option<String>,
    pub assignee_ref: Option<String>,
    pub execution_order: Option<i64>,
    pub can_parallelize: bool,
    pub parallel_group: Option<String>,
    pub dependencies: HashSet<String>,
    pub estimated_complexity: Option<Complexity>,
}

impl WorkItem {
    /// `parallel_group` is only meaningful when `can_parallelize` — enforce
    /// that invariant at construction rather than letting inconsistent data
    /// leak into the planner.
    pub fn new(id: impl Into<String>, identifier: impl Into<String>, item_type: WorkItemType) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            item_type,
            title: String::new(),
            description: String::new(),
            status_ref: None,
            assignee_ref: None,
            execution_order: None,
            can_parallelize: false,
            parallel_group: None,
            dependencies: HashSet::new(),
            estimated_complexity: None,
        }
    }

    pub fn parallelizable(mut self, group: Option<impl Into<String>>) -> Self {
        self.can_parallelize = true;
        self.parallel_group = group.map(Into::into);
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.execution_order = Some(order);
        self
    }

    pub fn complexity(mut self, complexity: Complexity) -> Self {
        self.estimated_complexity = Some(complexity);
        self
    }
}

/// A contiguous batch of items the pool can dispatch together (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub order: u32,
    pub items: Vec<WorkItem>,
    pub can_run_in_parallel: bool,
    pub estimated_complexity: Option<Complexity>,
}

/// The ordered list of phases the planner produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
    pub total_items: usize,
}

impl ExecutionPlan {
    pub fn flatten_ids(&self) -> Vec<&str> {
        self.phases
            .iter()
            .flat_map(|p| p.items.iter().map(|i| i.id.as_str()))
            .collect()
    }
}
