//! Mapping of isolation errors to HTTP responses.
//!
//! Authorization failures are indistinguishable from each other on the wire.
//! Internal failures are opaque; their detail goes to the logs, and to the
//! response body only when the server runs in development.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use practice_core::IsolationError;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Attached to internal error responses so a development-only layer can expose it.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

#[derive(Debug)]
pub enum ApiError {
    /// No verified identity was presented.
    Unauthenticated(String),
    Isolation(IsolationError),
}

impl From<IsolationError> for ApiError {
    fn from(err: IsolationError) -> Self {
        ApiError::Isolation(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Unauthenticated(_) => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "Authentication required".to_string(),
            ),
            ApiError::Isolation(e) if e.is_authorization_failure() => {
                (StatusCode::FORBIDDEN, "forbidden", "Access denied".to_string())
            }
            ApiError::Isolation(IsolationError::NotFound { .. }) => (
                StatusCode::NOT_FOUND,
                "not_found",
                "Resource not found".to_string(),
            ),
            ApiError::Isolation(IsolationError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            ApiError::Isolation(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal error".to_string(),
            ),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated(_) => "unauthenticated",
            ApiError::Isolation(e) => e.kind(),
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Unauthenticated(msg) => msg.clone(),
            ApiError::Isolation(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        let detail = self.detail();
        let kind = self.kind();

        if status.is_server_error() {
            error!(kind, error = %detail, "Request failed");
        } else if status == StatusCode::FORBIDDEN {
            warn!(kind, error = %detail, "Request denied");
        }
        metrics::counter!("api.errors", "kind" => kind).increment(1);

        let mut response = (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message,
                detail: None,
            }),
        )
            .into_response();
        if status.is_server_error() {
            response.extensions_mut().insert(ErrorDetail(detail));
        }
        response
    }
}

/// Development-only response mapper: copies the error detail of a 5xx
/// response into the body. Authorization failures stay opaque.
pub async fn attach_detail(response: Response) -> Response {
    if !response.status().is_server_error() {
        return response;
    }
    let Some(ErrorDetail(detail)) = response.extensions().get::<ErrorDetail>().cloned() else {
        return response;
    };
    let status = response.status();
    let (parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, usize::MAX).await else {
        return (status, Json(ErrorResponse {
            error: "internal_error".to_string(),
            message: "Internal error".to_string(),
            detail: Some(detail),
        }))
            .into_response();
    };
    let mut body: ErrorResponse = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => ErrorResponse {
            error: value["error"].as_str().unwrap_or("error").to_string(),
            message: value["message"].as_str().unwrap_or_default().to_string(),
            detail: None,
        },
        Err(_) => return Response::from_parts(parts, axum::body::Body::from(bytes)),
    };
    body.detail = Some(detail);
    (parts.status, Json(body)).into_response()
}
