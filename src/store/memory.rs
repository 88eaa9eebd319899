//! The in-memory `RunStore` backend: a per-run bounded ring of events,
//! guarded by `parking_lot`, with bounded-channel (`flume`) subscriber
//! fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::RunStoreError;
use crate::event::{Event, EventLevel};
use crate::plan::Plan;
use crate::run::{NodeState, RunMeta, RunStatus};

use super::{EventSubscription, Result, RunStore};

/// Per-subscriber bounded queue depth. Overflow removes the subscriber
/// rather than blocking the appender.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct RunRecord {
    name: String,
    plan: Plan,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    nodes: FxHashMap<String, NodeState>,
    events: VecDeque<Event>,
    next_seq: u64,
    subscribers: Vec<flume::Sender<Event>>,
}

impl RunRecord {
    fn new(name: String, plan: Plan) -> Self {
        let nodes = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::queued()))
            .collect();
        Self {
            name,
            plan,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            nodes,
            events: VecDeque::new(),
            next_seq: 1,
            subscribers: Vec::new(),
        }
    }

    fn meta(&self, run_id: &str) -> RunMeta {
        RunMeta {
            run_id: run_id.to_string(),
            name: self.name.clone(),
            plan: self.plan.clone(),
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            nodes: self
                .nodes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Process-local `RunStore`: bounded ring of the last `ring_capacity`
/// events per run (default 5000), fan-out to subscribers via bounded
/// per-subscriber `flume` channels.
pub struct InMemoryRunStore {
    runs: RwLock<FxHashMap<String, Mutex<RunRecord>>>,
    ring_capacity: usize,
    eviction_counter: AtomicU64,
}

impl InMemoryRunStore {
    pub const DEFAULT_RING_CAPACITY: usize = 5000;

    #[must_use]
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            runs: RwLock::new(FxHashMap::default()),
            ring_capacity: ring_capacity.max(1),
            eviction_counter: AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RING_CAPACITY)
    }
}

fn generate_run_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, name: String, plan: Plan) -> Result<String> {
        let run_id = generate_run_id();
        let mut runs = self.runs.write();
        runs.insert(run_id.clone(), Mutex::new(RunRecord::new(name, plan)));
        Ok(run_id)
    }

    async fn get_run_meta(&self, run_id: &str) -> Result<RunMeta> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        Ok(record.lock().meta(run_id))
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        Ok(self.runs.read().keys().cloned().collect())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        let mut record = record.lock();
        record.status = status;
        if started_at.is_some() {
            record.started_at = started_at;
        }
        if finished_at.is_some() {
            record.finished_at = finished_at;
        }
        Ok(())
    }

    async fn update_node_state(&self, run_id: &str, node_id: &str, node_state: NodeState) -> Result<()> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        record.lock().nodes.insert(node_id.to_string(), node_state);
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> Result<()> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        record.lock().status = RunStatus::Cancelled;
        Ok(())
    }

    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
        node_id: Option<String>,
        level: Option<EventLevel>,
    ) -> Result<Event> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        let mut record = record.lock();

        let seq = record.next_seq;
        record.next_seq += 1;
        let event = Event::new(seq, run_id, event_type, data, node_id, level);

        if record.events.len() >= self.ring_capacity {
            record.events.pop_front();
            self.eviction_counter.fetch_add(1, Ordering::Relaxed);
        }
        record.events.push_back(event.clone());

        record.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) | Err(flume::TrySendError::Disconnected(_)) => false,
        });

        Ok(event)
    }

    async fn get_events_since(&self, run_id: &str, last_event_id: Option<u64>) -> Result<Vec<Event>> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        let record = record.lock();
        Ok(match last_event_id {
            Some(last) => record.events.iter().filter(|e| e.id > last).cloned().collect(),
            None => record.events.iter().cloned().collect(),
        })
    }

    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription> {
        let runs = self.runs.read();
        let record = runs
            .get(run_id)
            .ok_or_else(|| RunStoreError::NotFound { run_id: run_id.to_string() })?;
        let (tx, rx) = flume::bounded(SUBSCRIBER_QUEUE_DEPTH);
        record.lock().subscribers.push(tx);
        Ok(rx.into_stream().boxed())
    }

    async fn adapter_info(&self) -> Value {
        serde_json::json!({
            "adapter": "memory",
            "details": {
                "runs": self.runs.read().len(),
                "ringCapacity": self.ring_capacity,
                "evictions": self.eviction_counter.load(Ordering::Relaxed),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanEdge;

    fn sample_plan() -> Plan {
        Plan {
            nodes: vec![crate::plan::PlanNode {
                id: "n1".to_string(),
                agent: "echo".to_string(),
                params: serde_json::json!({"args": ["A"]}),
                max_retries: None,
                backoff_seconds: None,
                timeout_ms: None,
            }],
            edges: Vec::<PlanEdge>::new(),
        }
    }

    #[tokio::test]
    async fn events_are_monotonic_and_retrievable() {
        let store = InMemoryRunStore::new(10);
        let run_id = store.create_run("t".into(), sample_plan()).await.unwrap();
        for i in 0..5 {
            store
                .append_event(&run_id, "log", serde_json::json!({"i": i}), None, None)
                .await
                .unwrap();
        }
        let events = store.get_events_since(&run_id, Some(2)).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, 3);
    }

    #[tokio::test]
    async fn ring_evicts_oldest_events() {
        let store = InMemoryRunStore::new(3);
        let run_id = store.create_run("t".into(), sample_plan()).await.unwrap();
        for i in 0..5 {
            store
                .append_event(&run_id, "log", serde_json::json!({"i": i}), None, None)
                .await
                .unwrap();
        }
        let events = store.get_events_since(&run_id, None).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, 3);
        assert_eq!(events[2].id, 5);
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped_not_blocked() {
        let store = InMemoryRunStore::new(100);
        let run_id = store.create_run("t".into(), sample_plan()).await.unwrap();
        let mut sub = store.subscribe(&run_id).await.unwrap();
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            store
                .append_event(&run_id, "log", serde_json::json!({"i": i}), None, None)
                .await
                .unwrap();
        }
        // The subscriber fell behind; it should have been dropped, so the
        // stream ends instead of blocking the appender above.
        let mut received = 0;
        while (sub.next().await).is_some() {
            received += 1;
            if received > SUBSCRIBER_QUEUE_DEPTH + 10 {
                panic!("subscriber stream did not terminate after overflow");
            }
        }
        assert!(received <= SUBSCRIBER_QUEUE_DEPTH);
    }
}
