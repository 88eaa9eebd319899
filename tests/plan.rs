use dagrun::error::PlanError;
use dagrun::plan::{resolve_cmd_reference, Plan, PlanEdge, PlanNode};
use proptest::prelude::*;

fn node(id: &str) -> PlanNode {
    PlanNode {
        id: id.to_string(),
        agent: "echo".to_string(),
        params: serde_json::json!({"args": ["x"]}),
        max_retries: None,
        backoff_seconds: None,
        timeout_ms: None,
    }
}

fn edge(from: &str, to: &str) -> PlanEdge {
    PlanEdge {
        from_node: format!("{from}.out"),
        to_node: format!("{to}.in"),
    }
}

/// Builds a chain `n0 -> n1 -> ... -> n(k-1)` plus, when `close_cycle` is
/// set, one extra edge back from the last node to the first, so every
/// generated plan is either a clean DAG or has exactly one cycle.
fn chain_plan(node_count: usize, close_cycle: bool) -> Plan {
    let ids: Vec<String> = (0..node_count).map(|i| format!("n{i}")).collect();
    let nodes = ids.iter().map(|id| node(id)).collect();
    let mut edges: Vec<PlanEdge> = ids.windows(2).map(|w| edge(&w[0], &w[1])).collect();
    if close_cycle && node_count > 1 {
        edges.push(edge(&ids[node_count - 1], &ids[0]));
    }
    Plan { nodes, edges }
}

proptest! {
    #[test]
    fn acyclic_chains_always_validate(node_count in 1usize..20) {
        let plan = chain_plan(node_count, false);
        prop_assert!(plan.validate().is_ok());
    }

    #[test]
    fn closing_a_chain_into_a_cycle_always_rejects(node_count in 2usize..20) {
        let plan = chain_plan(node_count, true);
        prop_assert!(matches!(plan.validate(), Err(PlanError::Cycle { .. })));
    }
}

#[test]
fn self_loop_is_a_cycle() {
    let plan = Plan {
        nodes: vec![node("n0")],
        edges: vec![edge("n0", "n0")],
    };
    assert!(matches!(plan.validate(), Err(PlanError::Cycle { .. })));
}

#[test]
fn diamond_shaped_dag_validates_with_correct_fanin() {
    let plan = Plan {
        nodes: vec![node("start"), node("left"), node("right"), node("end")],
        edges: vec![
            edge("start", "left"),
            edge("start", "right"),
            edge("left", "end"),
            edge("right", "end"),
        ],
    };
    let (dependents, remaining_preds) = plan.validate().unwrap();
    assert_eq!(remaining_preds["end"], 2);
    assert_eq!(dependents["start"].len(), 2);
}

#[test]
fn resolver_rejects_unknown_agent_with_no_args() {
    let n = PlanNode {
        id: "n0".to_string(),
        agent: "mystery-agent".to_string(),
        params: serde_json::json!({}),
        max_retries: None,
        backoff_seconds: None,
        timeout_ms: None,
    };
    assert!(matches!(
        resolve_cmd_reference(&n),
        Err(PlanError::UnresolvedCommand { .. })
    ));
}
