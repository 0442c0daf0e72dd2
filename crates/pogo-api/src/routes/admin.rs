//! Namespace and operational routes

use crate::response::{ok, ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::Router;
use serde_json::json;

/// Create the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/namespaces/:namespace/config", put(loadconf))
        .route("/ping", get(ping))
        .route("/stats", get(stats))
}

/// Load or replace a namespace YAML document
async fn loadconf(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    yaml: String,
) -> ApiResult {
    state
        .dispatcher
        .loadconf(&namespace, &yaml)
        .await
        .map_err(ApiError::from_core)?;
    Ok(ok(json!({ "namespace": namespace })))
}

/// Liveness probe; the historical answer is a single magic number
async fn ping(State(state): State<AppState>) -> ApiResult {
    Ok(ok(json!([state.dispatcher.ping()])))
}

/// Worker and job statistics
async fn stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.dispatcher.stats().await?;
    Ok(ok(stats))
}
