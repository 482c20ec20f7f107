//! HTTP request handlers.

use super::AppState;
use crate::aggregate::{HealthReport, Period};
use crate::manual::ManualRunError;
use crate::scheduler::{EndpointState, SchedulerStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub health: HealthReport,
    pub scheduler: SchedulerStatus,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshot.load();
    let health = state.aggregator.health(&snapshot, Utc::now());
    Json(StatusResponse {
        health,
        scheduler: state.scheduler.status(),
    })
}

// ============================================================================
// Endpoints
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiEndpoint {
    pub id: String,
    pub name: String,
    pub region: String,
    #[serde(rename = "type")]
    pub protocol: String,
    pub address: String,
    pub timeout_ms: u64,
    pub interval_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EndpointState>,
}

pub async fn handle_get_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.snapshot.load();
    let states = state.scheduler.endpoint_states();

    let endpoints: Vec<ApiEndpoint> = snapshot
        .endpoints()
        .map(|e| ApiEndpoint {
            id: e.id.clone(),
            name: e.name.clone(),
            region: e.region.clone(),
            protocol: e.protocol.as_str().to_string(),
            address: e.address.clone(),
            timeout_ms: e.timeout_ms,
            interval_seconds: e.interval(&snapshot.settings),
            state: states.iter().find(|(id, _)| *id == e.id).map(|(_, s)| *s),
        })
        .collect();

    Json(endpoints)
}

// ============================================================================
// Manual runs
// ============================================================================

fn manual_error(e: ManualRunError) -> Response {
    (StatusCode::NOT_FOUND, e.to_string()).into_response()
}

pub async fn handle_run_endpoint(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manual.run_one(&id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => manual_error(e),
    }
}

pub async fn handle_run_region(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.manual.run_region(&name).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => manual_error(e),
    }
}

pub async fn handle_run_all(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manual.run_all().await)
}

pub async fn handle_cancel(State(state): State<AppState>) -> impl IntoResponse {
    state.manual.cancel();
    StatusCode::NO_CONTENT
}

// ============================================================================
// Aggregates
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    pub period: Option<Period>,
    pub time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub period: Option<Period>,
    pub from: Option<String>,
    pub to: Option<String>,
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid timestamp {s:?}: {e}")).into_response()),
    }
}

pub async fn handle_get_bucket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BucketQuery>,
) -> Response {
    let time = match parse_time(query.time.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(resp) => return resp,
    };
    let period = query.period.unwrap_or(Period::Hourly);

    match state.aggregator.get_bucket(&id, period, time) {
        Some(bucket) => Json(bucket).into_response(),
        None => (StatusCode::NOT_FOUND, "No data for this window").into_response(),
    }
}

pub async fn handle_get_range(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let to = match parse_time(query.to.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(resp) => return resp,
    };
    let from = match parse_time(query.from.as_deref()) {
        Ok(t) => t.unwrap_or_else(|| to - ChronoDuration::hours(24)),
        Err(resp) => return resp,
    };
    if from > to {
        return (StatusCode::BAD_REQUEST, "from must not be after to").into_response();
    }

    let period = query.period.unwrap_or(Period::Hourly);
    Json(state.aggregator.range(&id, period, from, to)).into_response()
}

pub async fn handle_region_rollup(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<BucketQuery>,
) -> Response {
    let time = match parse_time(query.time.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(resp) => return resp,
    };
    let period = query.period.unwrap_or(Period::Hourly);

    let snapshot = state.snapshot.load();
    match state.aggregator.region_rollup(&snapshot, &name, period, time) {
        Some(rollup) => Json(rollup).into_response(),
        None => (StatusCode::NOT_FOUND, "Region not found").into_response(),
    }
}
