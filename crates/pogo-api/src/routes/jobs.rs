//! Job lifecycle routes

use crate::response::{ok, ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use pogo_core::{JobId, JobSpec, JobState, ListFilters};
use serde::Deserialize;
use serde_json::json;

/// Create the job router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/run", post(run))
        .route("/jobs", get(listjobs))
        .route("/jobs/:jobid", get(jobinfo))
        .route("/jobs/:jobid/status", get(jobstatus))
        .route("/jobs/:jobid/halt", post(halt))
        .route("/jobs/:jobid/retry", post(retry))
}

fn parse_jobid(raw: &str) -> Result<JobId, ApiError> {
    JobId::resolve(raw).map_err(|e| ApiError::from_core(e).with_jobid(raw))
}

/// Create and start a job
async fn run(State(state): State<AppState>, Json(spec): Json<JobSpec>) -> ApiResult {
    let jobid = state.dispatcher.run_job(spec).await?;
    Ok(ok(json!({ "jobid": jobid })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user: Option<String>,
    state: Option<String>,
    target: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
    page: Option<usize>,
}

fn parse_state(raw: &str) -> Result<JobState, ApiError> {
    serde_json::from_value(json!(raw)).map_err(|_| {
        ApiError::from_core(pogo_core::Error::invalid_spec(format!(
            "unknown job state filter: {}",
            raw
        )))
    })
}

/// Jobs newest-first, with ANDed filters
async fn listjobs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult {
    let filters = ListFilters {
        user: query.user,
        state: query.state.as_deref().map(parse_state).transpose()?,
        target: query.target,
        offset: query.offset,
        limit: query.limit,
        page: query.page,
    };
    let jobs = state.dispatcher.listjobs(filters).await?;
    Ok(ok(jobs))
}

/// Static spec plus current state summary
async fn jobinfo(State(state): State<AppState>, Path(jobid): Path<String>) -> ApiResult {
    let jobid = parse_jobid(&jobid)?;
    let info = state
        .dispatcher
        .jobinfo(jobid)
        .await
        .map_err(|e| ApiError::from_core(e).with_jobid(jobid))?;
    Ok(ok(info))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

/// Paginated host records
async fn jobstatus(
    State(state): State<AppState>,
    Path(jobid): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    let jobid = parse_jobid(&jobid)?;
    let page = state
        .dispatcher
        .jobstatus(jobid, query.offset, query.limit.unwrap_or(100))
        .await
        .map_err(|e| ApiError::from_core(e).with_jobid(jobid))?;
    Ok(ok(page))
}

#[derive(Debug, Default, Deserialize)]
struct HaltBody {
    #[serde(default)]
    reason: Option<String>,
}

/// Halt a job
async fn halt(
    State(state): State<AppState>,
    Path(jobid): Path<String>,
    body: Option<Json<HaltBody>>,
) -> ApiResult {
    let jobid = parse_jobid(&jobid)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let record = state
        .dispatcher
        .halt(jobid, reason)
        .await
        .map_err(|e| ApiError::from_core(e).with_jobid(jobid))?;
    Ok(ok(record))
}

#[derive(Debug, Deserialize)]
struct RetryBody {
    hosts: Vec<String>,
}

/// Requeue failed hosts
async fn retry(
    State(state): State<AppState>,
    Path(jobid): Path<String>,
    Json(body): Json<RetryBody>,
) -> ApiResult {
    let jobid = parse_jobid(&jobid)?;
    state
        .dispatcher
        .retry(jobid, body.hosts)
        .await
        .map_err(|e| ApiError::from_core(e).with_jobid(jobid))?;
    Ok(ok(json!({ "jobid": jobid })))
}
