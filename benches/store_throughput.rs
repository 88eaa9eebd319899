//! Throughput of `RunStore::append_event` against the in-memory backend,
//! the hot path for a run that streams many log lines.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dagrun::plan::{Plan, PlanNode};
use dagrun::store::memory::InMemoryRunStore;
use dagrun::store::RunStore;

fn sample_plan() -> Plan {
    Plan {
        nodes: vec![PlanNode {
            id: "n1".to_string(),
            agent: "echo".to_string(),
            params: serde_json::json!({"args": ["a"]}),
            max_retries: None,
            backoff_seconds: None,
            timeout_ms: None,
        }],
        edges: Vec::new(),
    }
}

fn append_event_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("append_event");

    for events in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(events as u64));
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, &events| {
            b.to_async(&rt).iter(|| async {
                let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new(5000));
                let run_id = store.create_run("bench".to_string(), sample_plan()).await.unwrap();
                for i in 0..events {
                    store
                        .append_event(&run_id, "log", serde_json::json!({"i": i}), None, None)
                        .await
                        .unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, append_event_throughput);
criterion_main!(benches);
