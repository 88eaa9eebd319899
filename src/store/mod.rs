//! RunStore: the pluggable persistence and fan-out layer.
//!
//! `RunStore` is a capability set, not a class hierarchy: an `async_trait`,
//! object-safe so it can live behind `Arc<dyn RunStore>`, with a
//! crate-local `Result` alias.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::OrchestratorConfig;
use crate::error::RunStoreError;
use crate::event::{Event, EventLevel};
use crate::plan::Plan;
use crate::run::{NodeState, RunMeta, RunStatus};

pub type Result<T> = std::result::Result<T, RunStoreError>;

/// A stream of events yielded to a live subscriber. Implementations MUST
/// NOT skip events to let a slow subscriber catch up; instead the stream
/// simply ends when the subscriber is dropped for being too slow.
pub type EventSubscription = futures_util::stream::BoxStream<'static, Event>;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, name: String, plan: Plan) -> Result<String>;
    async fn get_run_meta(&self, run_id: &str) -> Result<RunMeta>;
    async fn list_runs(&self) -> Result<Vec<String>>;
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        finished_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()>;
    async fn update_node_state(&self, run_id: &str, node_id: &str, node_state: NodeState) -> Result<()>;
    async fn cancel_run(&self, run_id: &str) -> Result<()>;
    async fn append_event(
        &self,
        run_id: &str,
        event_type: &str,
        data: Value,
        node_id: Option<String>,
        level: Option<EventLevel>,
    ) -> Result<Event>;
    async fn get_events_since(&self, run_id: &str, last_event_id: Option<u64>) -> Result<Vec<Event>>;
    async fn subscribe(&self, run_id: &str) -> Result<EventSubscription>;
    async fn adapter_info(&self) -> Value;
}

/// Select and construct the configured `RunStore` backend from
/// `ORCH_RUNSTORE`.
pub async fn from_env(config: &OrchestratorConfig) -> std::sync::Arc<dyn RunStore> {
    match config.runstore_backend.as_str() {
        #[cfg(feature = "redis-store")]
        "redis" => match redis::RedisRunStore::connect(&config.redis_url).await {
            Ok(store) => std::sync::Arc::new(store),
            Err(err) => {
                tracing::error!(error = %err, "failed to connect to redis run store, falling back to memory");
                std::sync::Arc::new(memory::InMemoryRunStore::new(memory::InMemoryRunStore::DEFAULT_RING_CAPACITY))
            }
        },
        #[cfg(not(feature = "redis-store"))]
        "redis" => {
            tracing::warn!("ORCH_RUNSTORE=redis but the redis-store feature is disabled; using memory");
            std::sync::Arc::new(memory::InMemoryRunStore::new(memory::InMemoryRunStore::DEFAULT_RING_CAPACITY))
        }
        _ => std::sync::Arc::new(memory::InMemoryRunStore::new(memory::InMemoryRunStore::DEFAULT_RING_CAPACITY)),
    }
}
