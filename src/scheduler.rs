//! Scheduler: owns the live execution of enqueued runs. Each run gets its
//! own `tokio` task; cancellation flows through an `AtomicBool` plus a
//! `watch` channel per active attempt, and a `tokio::time::timeout` around
//! a hand-rolled wait-any poll (see `wait_any` below) re-checks retry-gate
//! expiry while attempts are in flight.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::driver::SubprocessDriver;
use crate::error::{DriverError, SchedulerError};
use crate::event::event_type;
use crate::plan::{CommandResolver, Plan, PlanNode};
use crate::run::{NodeState, NodeStatus, RunStatus};
use crate::store::RunStore;

/// Re-check interval for retry-gate expiry while attempts are in flight.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Idle sleep when nothing is schedulable and nothing is active.
const IDLE_SLEEP: Duration = Duration::from_millis(50);
/// Retry backoff ceiling.
const MAX_BACKOFF_SECS: f64 = 60.0;

struct RunCtx {
    run_id: String,
    node_specs: FxHashMap<String, PlanNode>,
    dependents: FxHashMap<String, Vec<String>>,
    remaining_preds: Mutex<FxHashMap<String, usize>>,
    /// Cancellation senders for currently active attempts, keyed by node
    /// id. `cancel_run` uses these to cooperatively cancel each attempt;
    /// the run loop is the sole owner of insertion/removal.
    active: Mutex<HashMap<String, watch::Sender<bool>>>,
    cancelled: AtomicBool,
}

/// Owns the live registry `run_id -> RunCtx` and the global parallelism
/// semaphore. One instance per process, shared by all runs.
pub struct Scheduler {
    store: Arc<dyn RunStore>,
    driver: Arc<SubprocessDriver>,
    resolve_cmd: CommandResolver,
    runs: Mutex<FxHashMap<String, Arc<RunCtx>>>,
    semaphore: Option<Arc<Semaphore>>,
    /// `ORCH_MAX_RETRIES_DEFAULT`/`ORCH_BACKOFF_SECONDS_DEFAULT`: applied to
    /// a node only when its plan omitted the corresponding field.
    max_retries_default: u32,
    backoff_seconds_default: u64,
}

impl Scheduler {
    /// Construct a scheduler. `max_parallelism`, when `Some`, must be at
    /// least 1: a configured parallelism of zero would make every run
    /// starve forever, so it is rejected up front instead.
    pub fn new(
        store: Arc<dyn RunStore>,
        driver: Arc<SubprocessDriver>,
        resolve_cmd: CommandResolver,
        max_parallelism: Option<usize>,
    ) -> Result<Self, SchedulerError> {
        Self::with_defaults(store, driver, resolve_cmd, max_parallelism, 0, 2)
    }

    /// Construct a scheduler with explicit `ORCH_MAX_RETRIES_DEFAULT`/
    /// `ORCH_BACKOFF_SECONDS_DEFAULT` values, as read from
    /// [`crate::config::OrchestratorConfig`].
    pub fn with_defaults(
        store: Arc<dyn RunStore>,
        driver: Arc<SubprocessDriver>,
        resolve_cmd: CommandResolver,
        max_parallelism: Option<usize>,
        max_retries_default: u32,
        backoff_seconds_default: u64,
    ) -> Result<Self, SchedulerError> {
        if matches!(max_parallelism, Some(0)) {
            return Err(SchedulerError::InvalidParallelism);
        }
        Ok(Self {
            store,
            driver,
            resolve_cmd,
            runs: Mutex::new(FxHashMap::default()),
            semaphore: max_parallelism.map(|n| Arc::new(Semaphore::new(n))),
            max_retries_default,
            backoff_seconds_default,
        })
    }

    /// Register the run and emit the `queued` transitions. Duplicate
    /// `run_id`s are an idempotent no-op.
    pub async fn enqueue_run(&self, run_id: String, plan: &Plan) -> Result<(), SchedulerError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&run_id) {
            return Ok(());
        }

        let (dependents, remaining_preds) = plan.validate()?;
        let node_specs: FxHashMap<String, PlanNode> =
            plan.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();

        let ctx = Arc::new(RunCtx {
            run_id: run_id.clone(),
            node_specs,
            dependents,
            remaining_preds: Mutex::new(remaining_preds),
            active: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        });
        let node_ids: Vec<String> = ctx.node_specs.keys().cloned().collect();
        runs.insert(run_id.clone(), ctx);
        drop(runs);

        for node_id in node_ids {
            self.emit_node_status(&run_id, &node_id, "queued", None).await;
        }
        let _ = self
            .store
            .append_event(&run_id, event_type::STATUS, serde_json::json!({"status": "queued"}), None, None)
            .await;
        Ok(())
    }

    /// Mark the run running and spawn its independent run-loop task.
    pub async fn start_run(self: &Arc<Self>, run_id: &str) -> Result<(), SchedulerError> {
        let ctx = {
            let runs = self.runs.lock().await;
            runs.get(run_id)
                .cloned()
                .ok_or_else(|| SchedulerError::Store(crate::error::RunStoreError::NotFound { run_id: run_id.to_string() }))?
        };

        let now = Utc::now();
        self.store.update_run_status(run_id, RunStatus::Running, Some(now), None).await?;
        let _ = self.store.append_event(run_id, event_type::HELLO, serde_json::json!({}), None, None).await;
        let _ = self
            .store
            .append_event(run_id, event_type::STATUS, serde_json::json!({"status": "running"}), None, None)
            .await;

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_loop(ctx).await;
        });
        Ok(())
    }

    /// Cancel a run: a no-op once the run has already reached a terminal
    /// status (a cancellation arriving late must not emit a second
    /// terminal `status` event). Otherwise persist cancellation intent and
    /// flip the flag `try_schedule`/`check_completion` observe, and signal
    /// every active attempt to cancel.
    ///
    /// This method never itself emits the run-level `status=failed`
    /// event: by explicit product decision, cancellation is reported as
    /// `failed` at the run level, but only once every active attempt's
    /// own `node_status(failed, reason=cancelled)` has actually drained
    /// (see `check_completion`'s cancelled branch). Emitting it here
    /// eagerly would race ahead of those in-flight attempts, which are
    /// still being terminated (graceful signal, up to 2s grace, stream
    /// drain) on their own tasks.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), SchedulerError> {
        let meta = self.store.get_run_meta(run_id).await?;
        if meta.status.is_terminal() {
            return Ok(());
        }

        let ctx = self.runs.lock().await.get(run_id).cloned();

        let _ = self.store.cancel_run(run_id).await;

        if let Some(ctx) = &ctx {
            ctx.cancelled.store(true, Ordering::SeqCst);
            let active = ctx.active.lock().await;
            for sender in active.values() {
                let _ = sender.send(true);
            }
        }

        Ok(())
    }

    async fn emit_node_status(&self, run_id: &str, node_id: &str, status: &str, extra: Option<serde_json::Value>) {
        let mut data = serde_json::json!({"status": status});
        if let Some(extra) = extra {
            if let (Some(obj), Some(extra_obj)) = (data.as_object_mut(), extra.as_object()) {
                for (k, v) in extra_obj {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        let _ = self
            .store
            .append_event(run_id, event_type::NODE_STATUS, data, Some(node_id.to_string()), None)
            .await;
    }

    async fn run_loop(self: Arc<Self>, ctx: Arc<RunCtx>) {
        let mut handles: HashMap<String, JoinHandle<Result<i32, DriverError>>> = HashMap::new();

        self.try_schedule(&ctx, &mut handles).await;

        loop {
            if handles.is_empty() {
                let scheduled = self.try_schedule(&ctx, &mut handles).await;
                if !scheduled {
                    if self.check_completion(&ctx).await {
                        break;
                    }
                    tokio::time::sleep(IDLE_SLEEP).await;
                    continue;
                }
                continue;
            }

            if let Some((finished_id, result)) = wait_any(&mut handles, POLL_INTERVAL).await {
                let exit_code = match result {
                    Ok(Ok(code)) => code,
                    Ok(Err(DriverError::Cancelled)) => {
                        // The driver already appended this attempt's own
                        // node_status(failed, reason=cancelled); the run-level
                        // terminal status is decided by check_completion once
                        // every active attempt (this one included) has drained.
                        // The node's own persisted NodeState still needs to be
                        // moved off `running` here, or it would be left
                        // claiming running forever even once the run reaches
                        // its terminal status.
                        ctx.active.lock().await.remove(&finished_id);
                        self.on_node_cancelled(&ctx, &finished_id).await;
                        continue;
                    }
                    Ok(Err(_)) | Err(_) => 1,
                };
                ctx.active.lock().await.remove(&finished_id);
                self.on_node_finished(&ctx, &finished_id, exit_code).await;
            }

            self.try_schedule(&ctx, &mut handles).await;
            if self.check_completion(&ctx).await {
                break;
            }
        }
    }

    /// Scan for ready nodes and launch attempts.
    async fn try_schedule(&self, ctx: &Arc<RunCtx>, handles: &mut HashMap<String, JoinHandle<Result<i32, DriverError>>>) -> bool {
        if ctx.cancelled.load(Ordering::SeqCst) {
            return false;
        }

        let meta = match self.store.get_run_meta(&ctx.run_id).await {
            Ok(meta) => meta,
            Err(_) => return false,
        };

        let now = Utc::now();
        let mut scheduled = false;
        let remaining_preds = ctx.remaining_preds.lock().await;

        for (node_id, spec) in &ctx.node_specs {
            if handles.contains_key(node_id) {
                continue;
            }
            if remaining_preds.get(node_id).copied().unwrap_or(0) != 0 {
                continue;
            }
            let Some(node_state) = meta.nodes.get(node_id) else { continue };
            if node_state.status != NodeStatus::Queued {
                continue;
            }
            if let Some(gate) = node_state.next_earliest_start_at {
                if gate > now {
                    continue;
                }
            }

            let attempt = node_state.attempts + 1;
            let mut new_state = node_state.clone();
            new_state.status = NodeStatus::Running;
            new_state.attempts = attempt;
            new_state.started_at = Some(now);
            new_state.finished_at = None;
            new_state.error = None;
            new_state.last_exit_code = None;
            if self.store.update_node_state(&ctx.run_id, node_id, new_state).await.is_err() {
                continue;
            }

            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            ctx.active.lock().await.insert(node_id.clone(), cancel_tx);

            let argv = match (self.resolve_cmd)(spec) {
                Ok(argv) => argv,
                Err(_) => continue,
            };
            let timeout_secs = spec.timeout_ms.map(|ms| ms as f64 / 1000.0);
            let run_id = ctx.run_id.clone();
            let node_id_owned = node_id.clone();
            let driver = Arc::clone(&self.driver);
            let mut env = HashMap::new();
            env.insert("ATTEMPT".to_string(), attempt.to_string());

            let permit = match &self.semaphore {
                Some(sem) => Some(Arc::clone(sem).acquire_owned().await),
                None => None,
            };

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let cancel_fut = async move {
                    let _ = cancel_rx.changed().await;
                };
                driver.run_node(&run_id, &node_id_owned, &argv, &env, timeout_secs, cancel_fut).await
            });
            handles.insert(node_id.clone(), handle);
            scheduled = true;
        }

        scheduled
    }

    /// Handle a finished attempt: unblock dependents on success, schedule
    /// retry or finalize as permanently failed otherwise.
    async fn on_node_finished(&self, ctx: &Arc<RunCtx>, node_id: &str, exit_code: i32) {
        let Ok(meta) = self.store.get_run_meta(&ctx.run_id).await else { return };
        let Some(node_state) = meta.nodes.get(node_id) else { return };
        let spec = &ctx.node_specs[node_id];

        let finished_at = Utc::now();
        let duration_ms = node_state.started_at.map(|started| (finished_at - started).num_milliseconds());

        let mut new_state = node_state.clone();
        new_state.finished_at = Some(finished_at);
        new_state.duration_ms = duration_ms;

        if exit_code == 0 {
            new_state.status = NodeStatus::Succeeded;
            new_state.error = None;
            new_state.last_exit_code = Some(0);
            new_state.next_earliest_start_at = None;
            let _ = self.store.update_node_state(&ctx.run_id, node_id, new_state).await;

            let mut remaining_preds = ctx.remaining_preds.lock().await;
            if let Some(dependents) = ctx.dependents.get(node_id) {
                for dst in dependents {
                    if let Some(count) = remaining_preds.get_mut(dst) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        } else if node_state.attempts <= spec.effective_max_retries(self.max_retries_default) {
            let backoff_seconds = spec.effective_backoff_seconds(self.backoff_seconds_default);
            let delay = (backoff_seconds as f64 * 2f64.powi(node_state.attempts as i32 - 1)).min(MAX_BACKOFF_SECS);
            let retry_at = finished_at + chrono::Duration::milliseconds((delay * 1000.0) as i64);

            new_state.status = NodeStatus::Queued;
            new_state.error = Some(format!("exit_code={exit_code}"));
            new_state.last_exit_code = Some(exit_code);
            new_state.next_earliest_start_at = Some(retry_at);
            let _ = self.store.update_node_state(&ctx.run_id, node_id, new_state).await;

            self.emit_node_status(
                &ctx.run_id,
                node_id,
                "queued",
                Some(serde_json::json!({"attempts": node_state.attempts, "retryAt": retry_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)})),
            )
            .await;
        } else {
            new_state.status = NodeStatus::Failed;
            new_state.error = Some(format!("exit_code={exit_code}"));
            new_state.last_exit_code = Some(exit_code);
            new_state.next_earliest_start_at = None;
            let _ = self.store.update_node_state(&ctx.run_id, node_id, new_state).await;
        }
    }

    /// Finalize a node whose attempt was cancelled: the driver's own
    /// `node_status(failed, reason=cancelled)` event already covers the
    /// event log, but the node's persisted `NodeState` still needs to move
    /// off `running`/clear `finished_at` the same way every other terminal
    /// attempt outcome does. Never retried regardless of `max_retries`: a
    /// cancelled run is already headed to terminal `Failed`.
    async fn on_node_cancelled(&self, ctx: &Arc<RunCtx>, node_id: &str) {
        let Ok(meta) = self.store.get_run_meta(&ctx.run_id).await else { return };
        let Some(node_state) = meta.nodes.get(node_id) else { return };

        let finished_at = Utc::now();
        let duration_ms = node_state.started_at.map(|started| (finished_at - started).num_milliseconds());

        let mut new_state = node_state.clone();
        new_state.status = NodeStatus::Failed;
        new_state.finished_at = Some(finished_at);
        new_state.duration_ms = duration_ms;
        new_state.error = Some("cancelled".to_string());
        new_state.next_earliest_start_at = None;
        let _ = self.store.update_node_state(&ctx.run_id, node_id, new_state).await;
    }

    /// Evaluate terminal status. Returns `true` once the run has reached a
    /// terminal state. This is the sole place the cancelled path's
    /// run-level `status=failed` is emitted: it waits for `ctx.active` to
    /// drain so every cancelled attempt's own `node_status(failed,
    /// reason=cancelled)` event is already persisted before the run's
    /// final status event, preserving the ordering guarantee that a run's
    /// terminal status event is always the last event for that run.
    async fn check_completion(&self, ctx: &Arc<RunCtx>) -> bool {
        if ctx.cancelled.load(Ordering::SeqCst) {
            if !ctx.active.lock().await.is_empty() {
                return false;
            }
            let now = Utc::now();
            let _ = self.store.update_run_status(&ctx.run_id, RunStatus::Failed, None, Some(now)).await;
            let _ = self
                .store
                .append_event(&ctx.run_id, event_type::STATUS, serde_json::json!({"status": "failed"}), None, None)
                .await;
            return true;
        }

        let Ok(meta) = self.store.get_run_meta(&ctx.run_id).await else { return true };
        let statuses: Vec<NodeStatus> = meta.nodes.values().map(|n| n.status).collect();
        if statuses.is_empty() {
            return false;
        }

        let any_running = statuses.iter().any(|s| *s == NodeStatus::Running);
        let any_queued = statuses.iter().any(|s| *s == NodeStatus::Queued);
        let any_failed = statuses.iter().any(|s| *s == NodeStatus::Failed);
        let all_succeeded = statuses.iter().all(|s| *s == NodeStatus::Succeeded);

        if all_succeeded {
            let now = Utc::now();
            let _ = self.store.update_run_status(&ctx.run_id, RunStatus::Succeeded, None, Some(now)).await;
            let _ = self
                .store
                .append_event(&ctx.run_id, event_type::STATUS, serde_json::json!({"status": "succeeded"}), None, None)
                .await;
            return true;
        }

        if any_failed && !any_running && !any_queued {
            let now = Utc::now();
            let _ = self.store.update_run_status(&ctx.run_id, RunStatus::Failed, None, Some(now)).await;
            let _ = self
                .store
                .append_event(&ctx.run_id, event_type::STATUS, serde_json::json!({"status": "failed"}), None, None)
                .await;
            return true;
        }

        false
    }
}

/// Poll every in-flight attempt and resolve as soon as one completes, or
/// `None` once `timeout` elapses with nothing ready. Unlike
/// `futures_util::future::select_all`, this never takes ownership of the
/// handles it doesn't return, so a timed-out poll leaves every still-running
/// attempt exactly where the caller left it.
async fn wait_any(
    handles: &mut HashMap<String, JoinHandle<Result<i32, DriverError>>>,
    timeout: Duration,
) -> Option<(String, Result<Result<i32, DriverError>, tokio::task::JoinError>)> {
    let poll_next = poll_fn(|cx| {
        for (id, handle) in handles.iter_mut() {
            if let Poll::Ready(result) = Pin::new(handle).poll(cx) {
                return Poll::Ready((id.clone(), result));
            }
        }
        Poll::Pending
    });

    match tokio::time::timeout(timeout, poll_next).await {
        Ok((id, result)) => {
            handles.remove(&id);
            Some((id, result))
        }
        Err(_) => None,
    }
}
