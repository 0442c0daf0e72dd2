pub mod admin;
pub mod jobs;

pub use admin::router as admin_router;
pub use jobs::router as jobs_router;

use crate::response::ApiError;
use crate::state::AppState;
use axum::extract::OriginalUri;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router with all routes
pub fn create_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/", get(api_info))
        .nest("/api/v1", api_v1_routes())
        .fallback(unknown_action)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(|_: Box<dyn std::any::Any + Send>| {
            ApiError::internal_panic().into_response()
        }))
        .with_state(app_state)
}

/// API v1 routes
fn api_v1_routes() -> Router<AppState> {
    Router::new().merge(jobs_router()).merge(admin_router())
}

/// Typed error instead of a bare 404 for unknown actions
async fn unknown_action(OriginalUri(uri): OriginalUri) -> ApiError {
    ApiError::unknown_action(uri.path())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// API info endpoint
async fn api_info() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "name": "pogo",
        "version": pogo_core::VERSION,
        "api": "/api/v1",
    }))
}
