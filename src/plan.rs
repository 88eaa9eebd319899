//! Plan model: the DAG of nodes a [`crate::scheduler::Scheduler`] executes,
//! and the command resolver that maps a [`PlanNode`] to an argv.

use std::collections::{HashMap, HashSet, VecDeque};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanError;

/// One vertex in a [`Plan`]: a node id, an `agent` shorthand, and the
/// opaque `params` the command resolver consults.
///
/// `max_retries`/`backoff_seconds` are `None` when the submitted node
/// omitted them; callers resolve the effective value via
/// [`PlanNode::effective_max_retries`]/[`PlanNode::effective_backoff_seconds`]
/// against the process's `ORCH_MAX_RETRIES_DEFAULT`/
/// `ORCH_BACKOFF_SECONDS_DEFAULT` configuration rather than a fixed
/// constant, so that configuration takes effect without re-serializing
/// every plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub agent: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PlanNode {
    pub fn effective_max_retries(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    pub fn effective_backoff_seconds(&self, default: u64) -> u64 {
        self.backoff_seconds.unwrap_or(default)
    }
}

/// A directed edge between two `<node_id>.<pin_name>` endpoints. Only the
/// `node_id` prefix is significant to the core; pin names are reserved for
/// the external data-flow layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEdge {
    pub from_node: String,
    pub to_node: String,
}

impl PlanEdge {
    fn node_id(endpoint: &str) -> &str {
        endpoint.split('.').next().unwrap_or(endpoint)
    }

    pub fn src_node_id(&self) -> &str {
        Self::node_id(&self.from_node)
    }

    pub fn dst_node_id(&self) -> &str {
        Self::node_id(&self.to_node)
    }
}

/// A frozen, validated directed acyclic graph of nodes to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<PlanNode>,
    pub edges: Vec<PlanEdge>,
}

impl Plan {
    /// Validate node id uniqueness, edge endpoint references, and
    /// acyclicity. Returns the map of `dependents` and `remaining_preds`
    /// the [`crate::scheduler::Scheduler`] uses to seed a `RunCtx`, so that
    /// validation and DAG-shape bookkeeping share one traversal.
    pub fn validate(&self) -> Result<(FxHashMap<String, Vec<String>>, FxHashMap<String, usize>), PlanError> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(PlanError::EmptyNodeId);
            }
            if !seen.insert(node.id.as_str()) {
                return Err(PlanError::DuplicateNodeId { id: node.id.clone() });
            }
        }

        let mut dependents: FxHashMap<String, Vec<String>> =
            self.nodes.iter().map(|n| (n.id.clone(), Vec::new())).collect();
        let mut remaining_preds: FxHashMap<String, usize> =
            self.nodes.iter().map(|n| (n.id.clone(), 0usize)).collect();

        for edge in &self.edges {
            let src = edge.src_node_id();
            let dst = edge.dst_node_id();
            if !seen.contains(src) {
                return Err(PlanError::UnknownEdgeEndpoint {
                    node_id: src.to_string(),
                });
            }
            if !seen.contains(dst) {
                return Err(PlanError::UnknownEdgeEndpoint {
                    node_id: dst.to_string(),
                });
            }
            dependents.get_mut(src).unwrap().push(dst.to_string());
            *remaining_preds.get_mut(dst).unwrap() += 1;
        }

        self.reject_cycles(&dependents, &remaining_preds)?;
        Ok((dependents, remaining_preds))
    }

    /// Kahn's-algorithm cycle check: repeatedly remove zero-indegree
    /// nodes; any node left over at the end sits on (or behind) a cycle.
    fn reject_cycles(
        &self,
        dependents: &FxHashMap<String, Vec<String>>,
        remaining_preds: &FxHashMap<String, usize>,
    ) -> Result<(), PlanError> {
        let mut indegree: HashMap<&str, usize> = remaining_preds
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dst in dependents.get(id).map(Vec::as_slice).unwrap_or_default() {
                let entry = indegree.get_mut(dst.as_str()).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(dst.as_str());
                }
            }
        }

        if visited != self.nodes.len() {
            let node_id = indegree
                .into_iter()
                .find(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .unwrap_or_default();
            return Err(PlanError::Cycle { node_id });
        }
        Ok(())
    }
}

/// A pure function mapping a [`PlanNode`] to an argv; the Scheduler's sole
/// extension point. `Send + Sync` so it can be shared across a Scheduler's
/// concurrently-running attempts.
pub type CommandResolver = std::sync::Arc<dyn Fn(&PlanNode) -> Result<Vec<String>, PlanError> + Send + Sync>;

/// The reference command resolver: explicit `params.cmd`, then
/// `agent=echo`/`agent=python` presets, then a generic `params.args`
/// fallback, else a validation error.
pub fn resolve_cmd_reference(node: &PlanNode) -> Result<Vec<String>, PlanError> {
    if let Some(cmd) = node.params.get("cmd").and_then(Value::as_array) {
        return string_array(cmd, node);
    }

    match node.agent.as_str() {
        "echo" => {
            let empty = Vec::new();
            let args = node.params.get("args").and_then(Value::as_array).unwrap_or(&empty);
            let mut argv = vec!["echo".to_string()];
            argv.extend(string_array(args, node)?);
            Ok(argv)
        }
        "python" => {
            if let Some(args) = node.params.get("args").and_then(Value::as_array) {
                let mut argv = vec!["python".to_string()];
                argv.extend(string_array(args, node)?);
                return Ok(argv);
            }
            if let Some(code) = node.params.get("code").and_then(Value::as_str) {
                return Ok(vec!["python".to_string(), "-c".to_string(), code.to_string()]);
            }
            Err(PlanError::UnresolvedCommand {
                node_id: node.id.clone(),
                reason: "agent=python requires params.args or params.code".to_string(),
            })
        }
        other => {
            if let Some(args) = node.params.get("args").and_then(Value::as_array) {
                return string_array(args, node);
            }
            Err(PlanError::UnresolvedCommand {
                node_id: node.id.clone(),
                reason: format!("unknown agent `{other}` and no generic params.args"),
            })
        }
    }
}

fn string_array(values: &[Value], node: &PlanNode) -> Result<Vec<String>, PlanError> {
    values
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| PlanError::UnresolvedCommand {
                    node_id: node.id.clone(),
                    reason: "params.args/cmd must be an array of strings".to_string(),
                })
        })
        .collect()
}
