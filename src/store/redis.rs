//! The persistent `RunStore` backend, backed by Redis: `Client::open` +
//! `get_multiplexed_async_connection`, wrapped in
//! `Arc<Mutex<MultiplexedConnection>>`.
//!
//! Sequence numbers come from `INCR` on a per-run counter key rather than
//! the stream's native entry id, so ids stay stable even if the stream is
//! trimmed; events are appended with `XADD ... MAXLEN ~ N`;
//! `get_events_since` uses `XRANGE` filtered by the stored `seq` field;
//! `subscribe` loops a blocking `XREAD` from `$`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::RunStoreError;
use crate::event::{Event, EventLevel};
use crate::plan::Plan;
use crate::run::{NodeState, RunMeta, RunStatus};

use super::{EventSubscription, Result, RunStore};

const PREFIX: &str = "dagrun";
/// Approximate retention, matching the in-memory backend's default ring
/// size so both backends behave similarly under the same defaults.
const STREAM_MAXLEN: usize = 5000;

fn meta_key(run_id: &str) -> String {
    format!("{PREFIX}:{run_id}:meta")
}
fn plan_key(run_id: &str) -> String {
    format!("{PREFIX}:{run_id}:plan")
}
fn nodes_key(run_id: &str) -> String {
    format!("{PREFIX}:{run_id}:nodes")
}
fn events_key(run_id: &str) -> String {
    format!("{PREFIX}:{run_id}:events")
}
fn seq_key(run_id: &str) -> String {
    format!("{PREFIX}:{run_id}:seq")
}

fn map_err(err: RedisError) -> RunStoreError {
    RunStoreError::Backend { message: err.to_string() }
}

pub struct RedisRunStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
    degraded: AtomicBool,
    last_error: Arc<Mutex<Option<String>>>,
}

impl RedisRunStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(map_err)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(map_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            degraded: AtomicBool::new(false),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    async fn mark_degraded(&self, message: String) {
        self.degraded.store(true, Ordering::Relaxed);
        *self.last_error.lock().await = Some(message);
    }
}

fn generate_run_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn create_run(&self, name: String, plan: Plan) -> Result<String> {
        let run_id = generate_run_id();
        let nodes: HashMap<String, NodeState> = plan
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::queued()))
            .collect();

        let plan_json = serde_json::to_string(&plan).map_err(|e| RunStoreError::Other { message: e.to_string() })?;
        let nodes_json = serde_json::to_string(&nodes).map_err(|e| RunStoreError::Other { message: e.to_string() })?;

        let mut conn = self.conn.lock().await;
        redis::pipe()
            .hset(meta_key(&run_id), "runId", &run_id)
            .hset(meta_key(&run_id), "name", &name)
            .hset(meta_key(&run_id), "status", "queued")
            .set(plan_key(&run_id), &plan_json)
            .set(nodes_key(&run_id), &nodes_json)
            .set(seq_key(&run_id), 0)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(map_err)?;
        Ok(run_id)
    }

    async fn get_run_meta(&self, run_id: &str) -> Result<RunMeta> {
        let mut conn = self.conn.lock().await;
        let meta: HashMap<String, String> = conn.hgetall(meta_key(run_id)).await.map_err(map_err)?;
        if meta.is_empty() {
            return Err(RunStoreError::NotFound { run_id: run_id.to_string() });
        }
        let plan_json: String = conn.get(plan_key(run_id)).await.map_err(map_err)?;
        let plan: Plan = serde_json::from_str(&plan_json).map_err(|e| RunStoreError::Other { message: e.to_string() })?;
        let nodes_json: String = conn.get(nodes_key(run_id)).await.map_err(map_err)?;
        let nodes: HashMap<String, NodeState> =
            serde_json::from_str(&nodes_json).map_err(|e| RunStoreError::Other { message: e.to_string() })?;

        Ok(RunMeta {
            run_id: run_id.to_string(),
            name: meta.get("name").cloned().unwrap_or_default(),
            plan,
            status: parse_status(meta.get("status").map(String::as_str).unwrap_or("queued")),
            started_at: meta.get("startedAt").and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc)),
            finished_at: meta.get("finishedAt").and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc)),
            nodes,
        })
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let pattern = format!("{PREFIX}:*:meta");
        let mut run_ids = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await
                .map_err(map_err)?;
            for key in keys {
                if let Some(run_id) = key.split(':').nth(1) {
                    run_ids.push(run_id.to_string());
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(run_ids)
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut pipe = redis::pipe();
        pipe.hset(meta_key(run_id), "status", status_str(status));
        if let Some(started_at) = started_at {
            pipe.hset(meta_key(run_id), "startedAt", started_at.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        if let Some(finished_at) = finished_at {
            pipe.hset(meta_key(run_id), "finishedAt", finished_at.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        pipe.query_async::<()>(&mut *conn).await.map_err(map_err)?;
        Ok(())
    }

    async fn update_node_state(&self, run_id: &str, node_id: &str, node_state: NodeState) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let nodes_json: String = conn.get(nodes_key(run_id)).await.map_err(map_err)?;
        let mut nodes: HashMap<String, NodeState> =
            serde_json::from_str(&nodes_json).map_err(|e| RunStoreError::Other { message: e.to_string() })?;
        nodes.insert(node_id.to_string(), node_state);
        let updated = serde_json::to_string(&nodes).map_err(|e| RunStoreError::Other { message: e.to_string() })?;
        let _: () = conn.set(nodes_key(run_id), updated).await.map_err(map_err)?;
        Ok(())
    }

    async fn cancel_run(&self, run_id: &str) -> Result<()> {
        self.update_run_status(run_id, RunStatus::Cancelled, None, None).await
    }

    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
        node_id: Option<String>,
        level: Option<EventLevel>,
    ) -> Result<Event> {
        let mut conn = self.conn.lock().await;
        let seq: u64 = conn.incr(seq_key(run_id), 1).await.map_err(map_err)?;
        let event = Event::new(seq, run_id, event_type, data, node_id, level);
        let wire = event.to_wire();

        let mut fields: Vec<(&str, String)> = vec![
            ("seq", wire.id.clone()),
            ("ts", wire.ts.clone()),
            ("type", wire.event_type.to_string()),
            ("data", serde_json::to_string(wire.data).unwrap_or_else(|_| "{}".to_string())),
        ];
        if let Some(node_id) = wire.node_id {
            fields.push(("node_id", node_id.to_string()));
        }
        if let Some(level) = wire.level {
            fields.push(("level", serde_json::to_value(level).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default()));
        }

        let result: std::result::Result<String, RedisError> = conn
            .xadd_maxlen(events_key(run_id), StreamMaxlen::Approx(STREAM_MAXLEN), "*", &fields)
            .await;
        if let Err(err) = result {
            drop(conn);
            self.mark_degraded(err.to_string()).await;
        }

        Ok(event)
    }

    async fn get_events_since(&self, run_id: &str, last_event_id: Option<u64>) -> Result<Vec<Event>> {
        let mut conn = self.conn.lock().await;
        let entries: Vec<(String, HashMap<String, String>)> = redis::cmd("XRANGE")
            .arg(events_key(run_id))
            .arg("-")
            .arg("+")
            .query_async(&mut *conn)
            .await
            .unwrap_or_default();

        let mut events: Vec<Event> = entries
            .into_iter()
            .filter_map(|(_id, fields)| decode_stream_entry(run_id, &fields))
            .filter(|e| last_event_id.map(|last| e.id > last).unwrap_or(true))
            .collect();
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription> {
        let conn = Arc::clone(&self.conn);
        let run_id = run_id.to_string();
        let (tx, rx) = flume::bounded::<Event>(256);

        tokio::spawn(async move {
            let mut last_id = "$".to_string();
            loop {
                if tx.is_disconnected() {
                    break;
                }
                let opts = StreamReadOptions::default().block(5000).count(64);
                let reply: std::result::Result<StreamReadReply, RedisError> = {
                    let mut guard = conn.lock().await;
                    guard.xread_options(&[events_key(&run_id)], &[last_id.as_str()], &opts).await
                };
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(_) => {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };
                for key in reply.keys {
                    for stream_id in key.ids {
                        last_id = stream_id.id.clone();
                        let fields: HashMap<String, String> = stream_id
                            .map
                            .iter()
                            .filter_map(|(k, v)| match v {
                                redis::Value::BulkString(bytes) => {
                                    Some((k.clone(), String::from_utf8_lossy(bytes).to_string()))
                                }
                                _ => None,
                            })
                            .collect();
                        if let Some(event) = decode_stream_entry(&run_id, &fields) {
                            if tx.send_async(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |rx| async move {
            rx.recv_async().await.ok().map(|event| (event, rx))
        })))
    }

    async fn adapter_info(&self) -> Value {
        let ping: String = {
            let mut conn = self.conn.lock().await;
            redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .unwrap_or_else(|e: RedisError| format!("error: {e}"))
        };
        serde_json::json!({
            "adapter": "redis",
            "details": {
                "ping": ping,
                "degraded": self.degraded.load(Ordering::Relaxed),
                "lastError": *self.last_error.lock().await,
            }
        })
    }
}

fn decode_stream_entry(run_id: &str, fields: &HashMap<String, String>) -> Option<Event> {
    let seq: u64 = fields.get("seq")?.parse().ok()?;
    let event_type = fields.get("type").cloned().unwrap_or_else(|| "message".to_string());
    let data: Value = fields
        .get("data")
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    let node_id = fields.get("node_id").cloned();
    let level = fields
        .get("level")
        .and_then(|s| serde_json::from_value(Value::String(s.clone())).ok());
    let ts = fields
        .get("ts")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(Event {
        id: seq,
        ts,
        event_type,
        run_id: run_id.to_string(),
        node_id,
        level,
        data,
    })
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Queued => "queued",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "running" => RunStatus::Running,
        "succeeded" => RunStatus::Succeeded,
        "failed" => RunStatus::Failed,
        "cancelled" => RunStatus::Cancelled,
        _ => RunStatus::Queued,
    }
}
