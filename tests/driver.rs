use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use dagrun::driver::SubprocessDriver;
use dagrun::event::event_type;
use dagrun::plan::{Plan, PlanNode};
use dagrun::store::memory::InMemoryRunStore;
use dagrun::store::RunStore;

fn one_node_plan(id: &str) -> Plan {
    Plan {
        nodes: vec![PlanNode {
            id: id.to_string(),
            agent: "echo".to_string(),
            params: serde_json::json!({}),
            max_retries: None,
            backoff_seconds: None,
            timeout_ms: None,
        }],
        edges: Vec::new(),
    }
}

async fn new_run(store: &Arc<dyn RunStore>, node_id: &str) -> String {
    store.create_run("t".into(), one_node_plan(node_id)).await.unwrap()
}

#[tokio::test]
async fn ndjson_stdout_lines_become_typed_events() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#"echo '{"type":"progress","pct":50}'"#.to_string(),
    ];
    let exit_code = driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), None, std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit_code, 0);

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let progress = events.iter().find(|e| e.event_type == "progress").unwrap();
    assert_eq!(progress.data["pct"], 50);
}

#[tokio::test]
async fn plain_stdout_line_becomes_a_log_event() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec!["echo".to_string(), "hello there".to_string()];
    driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), None, std::future::pending())
        .await
        .unwrap();

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let log = events.iter().find(|e| e.event_type == event_type::LOG).unwrap();
    assert_eq!(log.data["message"], "hello there");
}

#[tokio::test]
async fn stderr_lines_become_error_level_logs() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec!["sh".to_string(), "-c".to_string(), "echo boom 1>&2".to_string()];
    driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), None, std::future::pending())
        .await
        .unwrap();

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let log = events
        .iter()
        .find(|e| e.event_type == event_type::LOG && e.data["message"] == "boom")
        .unwrap();
    assert_eq!(log.level, Some(dagrun::event::EventLevel::Error));
}

#[tokio::test]
async fn nonzero_exit_code_is_reported() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
    let exit_code = driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), None, std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit_code, 7);

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let status = events
        .iter()
        .rev()
        .find(|e| e.event_type == event_type::NODE_STATUS)
        .unwrap();
    assert_eq!(status.data["status"], "failed");
    assert_eq!(status.data["exitCode"], 7);
}

#[tokio::test]
async fn slow_node_times_out() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec!["sleep".to_string(), "5".to_string()];
    let exit_code = driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), Some(0.1), std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit_code, 1);

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let status = events
        .iter()
        .rev()
        .find(|e| e.event_type == event_type::NODE_STATUS)
        .unwrap();
    assert_eq!(status.data["reason"], "timeout");
}

#[tokio::test]
async fn cancellation_mid_run_is_reported_as_failed() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let argv = vec!["sleep".to_string(), "5".to_string()];
    let cancel = async { tokio::time::sleep(std::time::Duration::from_millis(50)).await };

    let result = driver.run_node(&run_id, "n1", &argv, &HashMap::new(), None, cancel).await;
    assert!(matches!(result, Err(dagrun::error::DriverError::Cancelled)));

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let status = events
        .iter()
        .rev()
        .find(|e| e.event_type == event_type::NODE_STATUS)
        .unwrap();
    assert_eq!(status.data["status"], "failed");
    assert_eq!(status.data["reason"], "cancelled");
}

#[tokio::test]
async fn script_file_node_streams_ndjson_then_succeeds() {
    let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::default());
    let driver = SubprocessDriver::new(Arc::clone(&store));
    let run_id = new_run(&store, "n1").await;

    let mut script = NamedTempFile::new().unwrap();
    writeln!(script, r#"echo '{{"type":"checkpoint","label":"mid","data":{{"progress":50}}}}'"#).unwrap();
    writeln!(script, "echo done").unwrap();
    let script_path = script.path().to_str().unwrap().to_string();

    let argv = vec!["sh".to_string(), script_path];
    let exit_code = driver
        .run_node(&run_id, "n1", &argv, &HashMap::new(), None, std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit_code, 0);

    let events = store.get_events_since(&run_id, None).await.unwrap();
    let checkpoint = events.iter().find(|e| e.event_type == "checkpoint").unwrap();
    assert_eq!(checkpoint.data["label"], "mid");
    assert_eq!(checkpoint.data["data"]["progress"], 50);
    assert!(events.iter().any(|e| e.event_type == event_type::LOG && e.data["message"] == "done"));
}
