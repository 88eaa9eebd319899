//! HTTP surface: create/get/cancel a run and stream its events over SSE.
//! The `axum::response::sse::Sse` endpoint generalizes a single
//! in-process workflow stream into the RunStore-backed, resumable,
//! multi-run case; `AppState` shares its store and scheduler behind one
//! `Arc` clone per request.

use std::sync::Arc;

use async_stream::stream;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{PlanError, RunStoreError, SchedulerError};
use crate::plan::Plan;
use crate::run::RunSnapshot;
use crate::scheduler::Scheduler;
use crate::store::RunStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub scheduler: Arc<Scheduler>,
    /// Header name used for execution-id propagation, e.g. `X-Execution-Id`.
    pub execution_id_header: String,
}

pub fn router(state: AppState) -> Router {
    let execution_id_header = state.execution_id_header.clone();
    Router::new()
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/{run_id}", get(get_run))
        .route("/api/v1/runs/{run_id}/cancel", post(cancel_run))
        .route("/api/v1/runs/{run_id}", axum::routing::delete(cancel_run))
        .route("/api/v1/runs/{run_id}/events", get(stream_events))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(move |req, next| {
                    execution_id_middleware(execution_id_header.clone(), req, next)
                })),
        )
        .with_state(state)
}

/// Reads the execution-id header if present, otherwise mints a fresh one,
/// logs it alongside the request, and echoes it back on the response so a
/// create-run call and its subsequent SSE subscribe can be correlated in
/// logs without a distributed tracing export pipeline.
async fn execution_id_middleware(header_name: String, mut req: Request, next: Next) -> Response {
    let execution_id = req
        .headers()
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let bytes: [u8; 16] = rand::random();
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        });

    tracing::info!(execution_id = %execution_id, "request");
    if let Ok(value) = HeaderValue::from_str(&execution_id) {
        req.headers_mut().insert(axum::http::HeaderName::from_bytes(header_name.as_bytes()).unwrap(), value.clone());
        let mut response = next.run(req).await;
        response.headers_mut().insert(axum::http::HeaderName::from_bytes(header_name.as_bytes()).unwrap(), value);
        response
    } else {
        next.run(req).await
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    name: String,
    plan: Plan,
    #[serde(default)]
    options: Option<CreateRunOptions>,
}

#[derive(Debug, Deserialize, Default)]
struct CreateRunOptions {
    #[serde(default, rename = "dryRun")]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct CreateRunResponse {
    #[serde(rename = "runId")]
    run_id: String,
}

/// Validates the plan synchronously (cycles, unknown agents, etc. never
/// create a run), then persists, enqueues and starts it. `options.dryRun`
/// short-circuits to echo the plan back without touching the RunStore.
async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    req.plan.validate().map_err(ApiError::from)?;

    if req.options.map(|o| o.dry_run).unwrap_or(false) {
        return Ok(Json(req.plan).into_response());
    }

    let run_id = state.store.create_run(req.name, req.plan.clone()).await?;
    state.scheduler.enqueue_run(run_id.clone(), &req.plan).await?;
    state.scheduler.start_run(&run_id).await?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })).into_response())
}

/// Projects `RunMeta` to `{runId, status, startedAt, finishedAt, nodes}`.
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<RunSnapshot>, ApiError> {
    let meta = state.store.get_run_meta(&run_id).await?;
    Ok(Json(meta.into()))
}

/// Cancels a run; the `DELETE` route is an alias for the same handler.
async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.scheduler.cancel_run(&run_id).await?;
    Ok(StatusCode::OK)
}

/// SSE stream honoring `Last-Event-ID` for resume. Backfill from the
/// RunStore's retained log is emitted before the live subscription's
/// events; absent a resume header, a synthetic `hello` event opens the
/// stream.
async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, std::convert::Infallible>>>, ApiError> {
    // Confirm the run exists before committing to a stream.
    state.store.get_run_meta(&run_id).await?;

    let last_event_id: Option<u64> = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    // Subscribe before reading backfill: if the scheduler appends an event
    // between the two, it must land in the live channel rather than being
    // dropped in the gap between the snapshot read and subscriber
    // registration. The live tail is then de-duplicated against the
    // backfilled ids below.
    let live = state.store.subscribe(&run_id).await?;
    let backfill = state.store.get_events_since(&run_id, last_event_id).await?;
    let last_backfilled_id = backfill.last().map(|e| e.id).or(last_event_id);

    let sse_stream = stream! {
        if last_event_id.is_none() {
            let hello = crate::event::Event::new(0, run_id.clone(), crate::event::event_type::HELLO, serde_json::json!({}), None, None);
            yield Ok(to_sse_event(&hello));
        }
        for event in &backfill {
            yield Ok(to_sse_event(event));
        }
        let mut live = live;
        while let Some(event) = live.next().await {
            if let Some(last_id) = last_backfilled_id {
                if event.id <= last_id {
                    continue;
                }
            }
            yield Ok(to_sse_event(&event));
        }
    };

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &crate::event::Event) -> SseEvent {
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.event_type.clone())
        .data(serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string()))
}

/// Crate-internal error taxonomy collapsed to the HTTP surface's two
/// buckets: validation/not-found becomes 4xx, everything else becomes
/// 500.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({"error": self.message}))).into_response()
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: err.to_string() }
    }
}

impl From<RunStoreError> for ApiError {
    fn from(err: RunStoreError) -> Self {
        let status = match err {
            RunStoreError::NotFound { .. } | RunStoreError::NodeNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Plan(plan_err) => plan_err.into(),
            SchedulerError::Store(store_err) => store_err.into(),
            SchedulerError::InvalidParallelism => {
                Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: err.to_string() }
            }
        }
    }
}

