use crate::coordinator::CoordinatorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    CoordinatorError(#[from] CoordinatorError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Too many requests, retry later")]
    RateLimited,

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::CoordinatorError(e) => match e {
                e if e.is_input_error() => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
                CoordinatorError::MessageNotFound(_) | CoordinatorError::NodeNotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                CoordinatorError::InvalidStateTransition(_) => {
                    (StatusCode::CONFLICT, "INVALID_STATE_TRANSITION")
                }
                CoordinatorError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
                CoordinatorError::StoreError(s) if s.is_timeout() => {
                    (StatusCode::SERVICE_UNAVAILABLE, "STORE_TIMEOUT")
                }
                CoordinatorError::TransportError(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": error_code,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
