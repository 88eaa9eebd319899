use dagrun::plan::{Plan, PlanNode};
use dagrun::run::{NodeState, NodeStatus, RunStatus};
use dagrun::store::memory::InMemoryRunStore;
use dagrun::store::RunStore;

fn two_node_plan() -> Plan {
    Plan {
        nodes: vec![
            PlanNode {
                id: "a".to_string(),
                agent: "echo".to_string(),
                params: serde_json::json!({"args": ["A"]}),
                max_retries: None,
                backoff_seconds: None,
                timeout_ms: None,
            },
            PlanNode {
                id: "b".to_string(),
                agent: "echo".to_string(),
                params: serde_json::json!({"args": ["B"]}),
                max_retries: None,
                backoff_seconds: None,
                timeout_ms: None,
            },
        ],
        edges: Vec::new(),
    }
}

#[tokio::test]
async fn create_run_seeds_all_nodes_queued() {
    let store = InMemoryRunStore::default();
    let run_id = store.create_run("t".into(), two_node_plan()).await.unwrap();
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.nodes.len(), 2);
    assert!(meta.nodes.values().all(|n| n.status == NodeStatus::Queued));
    assert_eq!(meta.status, RunStatus::Queued);
}

#[tokio::test]
async fn unknown_run_id_is_not_found() {
    let store = InMemoryRunStore::default();
    let err = store.get_run_meta("does-not-exist").await.unwrap_err();
    assert!(matches!(err, dagrun::error::RunStoreError::NotFound { .. }));
}

#[tokio::test]
async fn update_node_state_is_visible_in_run_meta() {
    let store = InMemoryRunStore::default();
    let run_id = store.create_run("t".into(), two_node_plan()).await.unwrap();

    let mut running = NodeState::queued();
    running.status = NodeStatus::Running;
    running.attempts = 1;
    store.update_node_state(&run_id, "a", running).await.unwrap();

    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.nodes["a"].status, NodeStatus::Running);
    assert_eq!(meta.nodes["b"].status, NodeStatus::Queued);
}

#[tokio::test]
async fn cancel_run_sets_cancelled_status() {
    let store = InMemoryRunStore::default();
    let run_id = store.create_run("t".into(), two_node_plan()).await.unwrap();
    store.cancel_run(&run_id).await.unwrap();
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn multiple_subscribers_each_see_every_event() {
    let store = InMemoryRunStore::default();
    let run_id = store.create_run("t".into(), two_node_plan()).await.unwrap();

    let mut sub1 = store.subscribe(&run_id).await.unwrap();
    let mut sub2 = store.subscribe(&run_id).await.unwrap();

    store
        .append_event(&run_id, "log", serde_json::json!({"i": 0}), None, None)
        .await
        .unwrap();

    use futures_util::StreamExt;
    let e1 = sub1.next().await.unwrap();
    let e2 = sub2.next().await.unwrap();
    assert_eq!(e1.id, 1);
    assert_eq!(e2.id, 1);
}

#[tokio::test]
async fn list_runs_reflects_created_runs() {
    let store = InMemoryRunStore::default();
    let r1 = store.create_run("t1".into(), two_node_plan()).await.unwrap();
    let r2 = store.create_run("t2".into(), two_node_plan()).await.unwrap();
    let mut runs = store.list_runs().await.unwrap();
    runs.sort();
    let mut expected = vec![r1, r2];
    expected.sort();
    assert_eq!(runs, expected);
}
