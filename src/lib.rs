//! # dagrun: agent-execution orchestrator core
//!
//! `dagrun` runs a DAG of agent nodes as subprocesses, persists their
//! status and event log in a pluggable `RunStore`, and exposes both over
//! an HTTP/SSE surface.
//!
//! ## Core concepts
//!
//! - [`plan`] — the `Plan` a caller submits: nodes, edges, per-node retry
//!   and timeout settings, plus cycle/reference validation and the
//!   ready-set computation the scheduler drives from.
//! - [`run`] — the mutable state of one in-flight or finished run:
//!   per-node status, overall run status, and the `RunSnapshot` returned
//!   to API callers.
//! - [`event`] — the append-only, monotonically-numbered event a run
//!   emits (`node_status`, `log`, `run_status`, ...), the wire shape
//!   behind both the HTTP backfill and the SSE stream.
//! - [`store`] — `RunStore`: the persistence and fan-out trait, with an
//!   in-memory ring-buffer backend and a Redis-streams backend behind
//!   the `redis-store` feature.
//! - [`driver`] — `SubprocessDriver`: runs one node attempt as a child
//!   process, turning its stdout/stderr into events.
//! - [`scheduler`] — `Scheduler`: drives a `Plan` to completion against a
//!   `RunStore` and a `SubprocessDriver`, with retries, backoff,
//!   cancellation and a parallelism cap.
//! - [`http`] — the axum router exposing runs over HTTP and SSE.
//! - [`config`] — environment-driven configuration.
//! - [`error`] — the crate's error taxonomy.
//! - [`telemetry`] — `tracing` subscriber initialization.
//!
//! ## Example
//!
//! ```
//! use dagrun::plan::{Plan, PlanNode};
//!
//! let plan = Plan {
//!     nodes: vec![PlanNode {
//!         id: "fetch".to_string(),
//!         agent: "echo".to_string(),
//!         params: serde_json::json!({"args": ["hello"]}),
//!         max_retries: None,
//!         backoff_seconds: None,
//!         timeout_ms: None,
//!     }],
//!     edges: Vec::new(),
//! };
//! assert!(plan.validate().is_ok());
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod http;
pub mod plan;
pub mod run;
pub mod scheduler;
pub mod store;
pub mod telemetry;
