//! Wire shape of every API response
//!
//! Handlers return `{ok: true, payload}` or `{ok: false, error: {kind,
//! message, jobid?, hostname?}}`. Secrets never appear in either shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

/// Success envelope
pub fn ok<T: Serialize>(payload: T) -> Response {
    Json(json!({ "ok": true, "payload": payload })).into_response()
}

/// Error envelope carried to the client
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobid: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(skip)]
    pub status: u16,
}

impl ApiError {
    /// Wrap a core error
    pub fn from_core(err: pogo_core::Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            jobid: None,
            hostname: None,
            status: err.status_code(),
        }
    }

    /// Attach the job the failure concerns
    pub fn with_jobid(mut self, jobid: impl ToString) -> Self {
        self.jobid = Some(jobid.to_string());
        self
    }

    /// Attach the host the failure concerns
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// The typed error for a route that does not exist
    pub fn unknown_action(path: &str) -> Self {
        Self {
            kind: "UnknownAction".to_string(),
            message: format!("no such action: {}", path),
            jobid: None,
            hostname: None,
            status: 404,
        }
    }

    /// The error a panic in a handler maps to
    pub fn internal_panic() -> Self {
        Self {
            kind: "Internal".to_string(),
            message: "internal error".to_string(),
            jobid: None,
            hostname: None,
            status: 500,
        }
    }
}

impl From<pogo_core::Error> for ApiError {
    fn from(err: pogo_core::Error) -> Self {
        Self::from_core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "ok": false, "error": self }))).into_response()
    }
}

/// Result alias for handlers
pub type ApiResult = std::result::Result<Response, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_shape() {
        let err = ApiError::from_core(pogo_core::Error::invalid_spec("bad"))
            .with_jobid("p0000000001")
            .with_hostname("web1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "InvalidSpec");
        assert_eq!(json["jobid"], "p0000000001");
        assert_eq!(json["hostname"], "web1");
        assert!(json.get("status").is_none());
    }
}
