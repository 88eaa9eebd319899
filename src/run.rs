//! Run and node state: the data RunStore persists and the HTTP surface
//! projects to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Failed)
    }
}

/// Per-node execution state. Invariants: `attempts >= 1` iff the node has
/// ever transitioned to running; `duration_ms` set iff both `started_at`
/// and `finished_at` are set; terminal statuses never revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_earliest_start_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn queued() -> Self {
        Self {
            status: NodeStatus::Queued,
            attempts: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
            last_exit_code: None,
            next_earliest_start_at: None,
        }
    }
}

/// The persisted metadata for a single execution of a [`Plan`]. Created by
/// `RunStore::create_run`, never mutated externally afterward except via
/// `RunStore` methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub name: String,
    pub plan: Plan,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: std::collections::HashMap<String, NodeState>,
}

/// Wire projection of `GET /api/v1/runs/{run_id}`:
/// `{runId, status, startedAt, finishedAt, nodes}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: std::collections::HashMap<String, NodeState>,
}

impl From<RunMeta> for RunSnapshot {
    fn from(meta: RunMeta) -> Self {
        Self {
            run_id: meta.run_id,
            status: meta.status,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            nodes: meta.nodes,
        }
    }
}
