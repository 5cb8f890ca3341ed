//! HTTP handlers
//!
//! Thin JSON wrappers over the coordinator. Library errors map onto status
//! codes in [`error_response`]; no handler panics on bad input.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::coordinator::CoordinatorStatus;
use crate::error::CoordinatorError;
use crate::metrics::ObservationPayload;
use crate::scheduler::SchedulerState;
use crate::server::ServerState;
use crate::triggers::Trigger;
use crate::types::{Observation, TimeRange};

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub metric: String,
    pub count: usize,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
pub struct PurgeParams {
    pub metric: Option<String>,
    pub older_than: Option<DateTime<Utc>>,
}

/// Cycle request; an empty dimension list runs every defined dimension
#[derive(Debug, Default, Deserialize)]
pub struct CycleRequest {
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub trigger_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(flatten)]
    pub coordinator: CoordinatorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerState>,
}

/// Map a library error onto a status code and JSON body
pub fn error_response(error: CoordinatorError) -> Response {
    let (status, label) = match &error {
        CoordinatorError::UnknownDimension(_) => (StatusCode::NOT_FOUND, "Unknown dimension"),
        CoordinatorError::UnknownTrigger(_) => (StatusCode::NOT_FOUND, "Unknown trigger"),
        CoordinatorError::Cancelled { .. } => (StatusCode::CONFLICT, "Cycle cancelled"),
        e if e.is_data_error() => (StatusCode::BAD_REQUEST, "Invalid data"),
        _ => (StatusCode::BAD_REQUEST, "Invalid configuration"),
    };

    (
        status,
        Json(json!({
            "error": label,
            "details": error.to_string()
        })),
    )
        .into_response()
}

/// Record one observation
pub async fn record_observation_handler(
    State(state): State<ServerState>,
    Json(payload): Json<ObservationPayload>,
) -> Response {
    match state.coordinator.store().record_json(payload).await {
        Ok(observation) => (StatusCode::CREATED, Json(observation)).into_response(),
        Err(e) => error_response(e),
    }
}

/// Query a metric's observations in timestamp order
pub async fn query_observations_handler(
    State(state): State<ServerState>,
    Path(metric): Path<String>,
    Query(params): Query<QueryParams>,
) -> Response {
    let range = match TimeRange::new(params.from, params.to) {
        Ok(range) => range,
        Err(e) => return error_response(e),
    };

    let series = state
        .coordinator
        .store()
        .query(&metric, range, params.limit)
        .await;
    let observations = series.to_vec();

    Json(QueryResponse {
        metric,
        count: observations.len(),
        observations,
    })
    .into_response()
}

/// Purge observations by metric and/or age
pub async fn purge_observations_handler(
    State(state): State<ServerState>,
    Query(params): Query<PurgeParams>,
) -> Response {
    let deleted = state
        .coordinator
        .store()
        .purge(params.metric.as_deref(), params.older_than)
        .await;
    Json(json!({ "deleted": deleted })).into_response()
}

/// Run one evaluate, check and dispatch cycle
pub async fn run_cycle_handler(
    State(state): State<ServerState>,
    Json(req): Json<CycleRequest>,
) -> Response {
    let window = match TimeRange::new(req.from, req.to) {
        Ok(window) => window,
        Err(e) => return error_response(e),
    };

    let result = if req.dimensions.is_empty() {
        state.coordinator.run_cycle_all(window).await
    } else {
        state
            .coordinator
            .run_cycle(req.dimensions.as_slice(), window)
            .await
    };

    match result {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

/// Activation history, oldest first
pub async fn history_handler(
    State(state): State<ServerState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let range = match TimeRange::new(params.from, params.to) {
        Ok(range) => range,
        Err(e) => return error_response(e),
    };

    let records = state
        .coordinator
        .dispatcher()
        .history(params.trigger_id.as_deref(), range)
        .await;
    Json(records).into_response()
}

pub async fn dimensions_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.coordinator.evaluator().dimensions().await)
}

/// Registered trigger plus the earliest time its cooldown lets it fire again
#[derive(Debug, Serialize)]
pub struct TriggerView {
    #[serde(flatten)]
    pub trigger: Trigger,
    pub ready_at: Option<DateTime<Utc>>,
}

pub async fn triggers_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let triggers: Vec<TriggerView> = state
        .coordinator
        .registry()
        .list()
        .await
        .into_iter()
        .map(|trigger| TriggerView {
            ready_at: trigger.ready_at(),
            trigger,
        })
        .collect();
    Json(triggers)
}

pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let scheduler = match &state.scheduler {
        Some(scheduler) => Some(scheduler.read().await.clone()),
        None => None,
    };

    Json(StatusResponse {
        status: "ok".to_string(),
        coordinator: state.coordinator.status().await,
        scheduler,
    })
}
