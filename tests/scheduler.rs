use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use dagrun::driver::SubprocessDriver;
use dagrun::plan::{resolve_cmd_reference, Plan, PlanEdge, PlanNode};
use dagrun::run::{NodeStatus, RunStatus};
use dagrun::scheduler::Scheduler;
use dagrun::store::memory::InMemoryRunStore;
use dagrun::store::RunStore;

fn new_scheduler(max_parallelism: Option<usize>) -> (Arc<dyn RunStore>, Arc<Scheduler>) {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = Arc::new(SubprocessDriver::new(Arc::clone(&store)));
    let scheduler = Arc::new(
        Scheduler::new(Arc::clone(&store), driver, Arc::new(resolve_cmd_reference), max_parallelism).unwrap(),
    );
    (store, scheduler)
}

async fn await_terminal(store: &Arc<dyn RunStore>, run_id: &str) -> RunStatus {
    for _ in 0..200 {
        let meta = store.get_run_meta(run_id).await.unwrap();
        if meta.status.is_terminal() || meta.status == RunStatus::Cancelled {
            return meta.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} never reached a terminal status");
}

fn node(id: &str, args: &[&str]) -> PlanNode {
    PlanNode {
        id: id.to_string(),
        agent: "echo".to_string(),
        params: serde_json::json!({"cmd": args}),
        max_retries: None,
        backoff_seconds: None,
        timeout_ms: None,
    }
}

#[tokio::test]
async fn linear_two_node_plan_runs_to_success() {
    let (store, scheduler) = new_scheduler(Some(2));
    let plan = Plan {
        nodes: vec![node("a", &["echo", "A"]), node("b", &["echo", "B"])],
        edges: vec![PlanEdge {
            from_node: "a.out".into(),
            to_node: "b.in".into(),
        }],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Succeeded);

    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert!(meta.nodes.values().all(|n| n.status == NodeStatus::Succeeded));
}

#[tokio::test]
async fn failing_node_fails_the_run() {
    let (store, scheduler) = new_scheduler(Some(2));
    let plan = Plan {
        nodes: vec![node("a", &["sh", "-c", "exit 1"])],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Failed);
}

#[tokio::test]
async fn node_exhausts_retries_then_fails_the_run() {
    let (store, scheduler) = new_scheduler(Some(2));
    let mut flaky = node("a", &["sh", "-c", "exit 1"]);
    flaky.max_retries = Some(2);
    flaky.backoff_seconds = Some(0);
    let plan = Plan {
        nodes: vec![flaky],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Failed);

    // max_retries=2 bounds total attempts at max_retries + 1 (spec.md §8's
    // retry-bound invariant): three node_status(running) transitions, then
    // permanent failure.
    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.nodes["a"].attempts, 3);
}

#[tokio::test]
async fn node_retries_then_succeeds_on_a_later_attempt() {
    let (store, scheduler) = new_scheduler(Some(2));
    let marker = NamedTempFile::new().unwrap().into_temp_path();
    std::fs::remove_file(&marker).ok();
    let marker_path = marker.to_str().unwrap().to_string();

    let mut flaky = node(
        "a",
        &[
            "sh",
            "-c",
            &format!("test -f {marker_path} && exit 0 || {{ touch {marker_path}; exit 1; }}"),
        ],
    );
    flaky.max_retries = Some(1);
    flaky.backoff_seconds = Some(0);
    let plan = Plan {
        nodes: vec![flaky],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Succeeded);

    let meta = store.get_run_meta(&run_id).await.unwrap();
    assert_eq!(meta.nodes["a"].attempts, 2);
    std::fs::remove_file(&marker_path).ok();
}

#[tokio::test]
async fn backoff_delays_the_retry_by_at_least_backoff_seconds() {
    let (store, scheduler) = new_scheduler(Some(2));
    let mut flaky = node("a", &["sh", "-c", "exit 1"]);
    flaky.max_retries = Some(1);
    flaky.backoff_seconds = Some(1);
    let plan = Plan {
        nodes: vec![flaky],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let _ = await_terminal(&store, &run_id).await;

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let running_ts: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "node_status" && e.data["status"] == "running")
        .map(|e| e.ts)
        .collect();
    assert_eq!(running_ts.len(), 2, "expected exactly two running transitions (attempt 1 and retry)");

    let gap = running_ts[1] - running_ts[0];
    assert!(
        gap >= chrono::Duration::milliseconds(950),
        "retry started only {}ms after the first attempt, wanted >= ~1000ms backoff",
        gap.num_milliseconds()
    );
}

#[tokio::test]
async fn cancelling_a_running_run_reports_failed_not_cancelled() {
    let (store, scheduler) = new_scheduler(Some(1));
    let plan = Plan {
        nodes: vec![node("a", &["sleep", "5"])],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.cancel_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Failed);

    let meta = store.get_run_meta(&run_id).await.unwrap();
    let node = &meta.nodes["a"];
    assert_eq!(node.status, NodeStatus::Failed);
    assert!(node.finished_at.is_some(), "cancelled node must not be left running forever");
}

#[tokio::test]
async fn independent_branches_respect_parallelism_cap() {
    let (store, scheduler) = new_scheduler(Some(1));
    let plan = Plan {
        nodes: vec![node("a", &["echo", "A"]), node("b", &["echo", "B"])],
        edges: vec![],
    };

    let run_id = store.create_run("t".into(), plan.clone()).await.unwrap();
    scheduler.enqueue_run(run_id.clone(), &plan).await.unwrap();
    scheduler.start_run(&run_id).await.unwrap();

    let status = await_terminal(&store, &run_id).await;
    assert_eq!(status, RunStatus::Succeeded);
}
