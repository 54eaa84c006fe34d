//! Mapping from engine errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ModelError, SummaryError};

/// An error returned by a gateway handler.
#[derive(Debug)]
pub enum ApiError {
    Summary(SummaryError),
    BadRequest(String),
}

impl From<SummaryError> for ApiError {
    fn from(err: SummaryError) -> Self {
        ApiError::Summary(err)
    }
}

impl ApiError {
    /// HTTP status and stable machine-readable code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        let err = match self {
            ApiError::BadRequest(_) => return (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Summary(err) => err,
        };
        if err.is_data_unavailable() {
            return (StatusCode::NOT_FOUND, "unavailable");
        }
        match err {
            SummaryError::ServiceDisabled => (StatusCode::SERVICE_UNAVAILABLE, "service_disabled"),
            SummaryError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            SummaryError::RefreshInProgress { .. } => (StatusCode::CONFLICT, "refresh_in_progress"),
            SummaryError::AgentNotFound { .. } => (StatusCode::NOT_FOUND, "agent_not_found"),
            SummaryError::StoreQueryFailed(_) | SummaryError::PersistenceFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
            SummaryError::ModelInvocationFailed(ModelError::Timeout { .. }) => {
                (StatusCode::GATEWAY_TIMEOUT, "model_timeout")
            }
            SummaryError::ModelInvocationFailed(_) => (StatusCode::BAD_GATEWAY, "model_error"),
            SummaryError::TranscriptUnavailable(_) | SummaryError::MissingProjectKey { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "transcript_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::Summary(err) => err.to_string(),
            ApiError::BadRequest(message) => message.clone(),
        };
        let mut body = serde_json::json!({ "error": message, "code": code });
        if code == "unavailable" {
            body["status"] = serde_json::Value::from("unavailable");
        }
        (status, Json(body)).into_response()
    }
}
