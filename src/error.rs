//! Crate-wide error taxonomy.
//!
//! Each leaf error type follows the same `thiserror` + `miette::Diagnostic`
//! idiom: a `#[error(...)]` message and a `#[diagnostic(code(...),
//! help(...))]` pair giving an actionable next step.
//!
//! The HTTP layer only ever distinguishes two buckets: a validation/
//! not-found error becomes a 4xx response, everything else becomes a 500.
//! The `ApiError` wrapper and its `IntoResponse` impl live in `http`, not
//! here, since the mapping is an HTTP-surface concern rather than a
//! property of the errors themselves.

use thiserror::Error;

/// Errors raised while parsing or validating a [`crate::plan::Plan`].
#[derive(Debug, Error, miette::Diagnostic)]
pub enum PlanError {
    #[error("plan node id must be non-empty")]
    #[diagnostic(
        code(dagrun::plan::empty_node_id),
        help("Every node in `nodes` must carry a non-empty, unique `id`.")
    )]
    EmptyNodeId,

    #[error("duplicate plan node id: {id}")]
    #[diagnostic(
        code(dagrun::plan::duplicate_node_id),
        help("Node ids must be unique within a plan; rename one of the `{id}` nodes.")
    )]
    DuplicateNodeId { id: String },

    #[error("edge references unknown node: {node_id}")]
    #[diagnostic(
        code(dagrun::plan::unknown_edge_endpoint),
        help("Edge endpoints are `<node_id>.<pin_name>`; `{node_id}` must match a declared node id.")
    )]
    UnknownEdgeEndpoint { node_id: String },

    #[error("plan contains a cycle involving node {node_id}")]
    #[diagnostic(
        code(dagrun::plan::cycle),
        help("The plan graph must be acyclic; remove or redirect the edge that closes the cycle at `{node_id}`.")
    )]
    Cycle { node_id: String },

    #[error("unresolvable command for node {node_id}: {reason}")]
    #[diagnostic(
        code(dagrun::plan::unresolved_command),
        help("Set `params.cmd`, or use a known `agent` preset (`echo`, `python`) with matching `params`.")
    )]
    UnresolvedCommand { node_id: String, reason: String },
}

/// Errors raised by a [`crate::store::RunStore`] implementation.
#[derive(Debug, Error, miette::Diagnostic)]
pub enum RunStoreError {
    #[error("run not found: {run_id}")]
    #[diagnostic(
        code(dagrun::store::not_found),
        help("Ensure `{run_id}` was created via `RunStore::create_run` and has not been evicted.")
    )]
    NotFound { run_id: String },

    #[error("node not found: {node_id} in run {run_id}")]
    #[diagnostic(
        code(dagrun::store::node_not_found),
        help("`{node_id}` must match a node declared in the run's plan.")
    )]
    NodeNotFound { run_id: String, node_id: String },

    #[error("run store backend error: {message}")]
    #[diagnostic(
        code(dagrun::store::backend),
        help("Check connectivity/credentials for the configured backend; backend message: {message}.")
    )]
    Backend { message: String },

    #[error("run store error: {message}")]
    #[diagnostic(code(dagrun::store::other))]
    Other { message: String },
}

/// Errors raised by [`crate::driver::SubprocessDriver`].
#[derive(Debug, Error, miette::Diagnostic)]
pub enum DriverError {
    #[error("failed to spawn child process: {message}")]
    #[diagnostic(
        code(dagrun::driver::spawn_failed),
        help("Verify the resolved argv[0] is an executable on PATH; OS message: {message}.")
    )]
    SpawnFailed { message: String },

    #[error("driver cancelled before the child process exited")]
    #[diagnostic(code(dagrun::driver::cancelled))]
    Cancelled,

    #[error("run store error while reporting node progress: {0}")]
    #[diagnostic(code(dagrun::driver::store))]
    Store(#[from] RunStoreError),
}

/// Errors raised by [`crate::scheduler::Scheduler`].
#[derive(Debug, Error, miette::Diagnostic)]
pub enum SchedulerError {
    #[error("scheduler cannot be constructed with a parallelism limit of zero when explicitly configured")]
    #[diagnostic(
        code(dagrun::scheduler::invalid_parallelism),
        help("Pass `None` for unbounded parallelism, or a value of at least 1.")
    )]
    InvalidParallelism,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] RunStoreError),
}
