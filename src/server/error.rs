use axum::Json;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use crate::proxy::RelayError;

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: String,
}

/// Admin API errors (plain `{"error": …}` bodies).
#[derive(thiserror::Error, Debug)]
pub(crate) enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(err) => {
                tracing::error!(err = %err, "api internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

pub(crate) fn map_storage_not_found(e: anyhow::Error, what: &str) -> ApiError {
    if e.to_string().starts_with(&format!("{what} not found")) {
        ApiError::NotFound(format!("{what} not found"))
    } else {
        ApiError::Internal(e)
    }
}

/// Proxy-surface errors keep the upstream-style `{"error":{…}}` envelope the
/// clients of these protocols expect.
pub(crate) fn relay_error_response(e: RelayError) -> Response<Body> {
    let (status, error_type, message) = match e {
        RelayError::AuthMissing => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "missing api key".to_string(),
        ),
        RelayError::AuthInvalid => (
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid api key".to_string(),
        ),
        RelayError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
        RelayError::ModelNotFound => (
            StatusCode::NOT_FOUND,
            "not_found_error",
            "model not found".to_string(),
        ),
        RelayError::Upstream { status, message } => (
            status.unwrap_or(StatusCode::BAD_GATEWAY),
            "proxy_error",
            message,
        ),
        RelayError::Storage(err) => {
            tracing::error!(err = %err, "relay internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "internal error".to_string(),
            )
        }
    };

    let body = json!({"error": {"message": message, "type": error_type}});
    (status, Json(body)).into_response()
}
