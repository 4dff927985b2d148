//! Mapping of service errors onto HTTP responses.
//!
//! Every error body is `{"code": ..., "message": ...}`. Internal failures
//! are already logged where they happened and reach the client only as a
//! generic message.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, UpstreamError};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::UpstreamValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Upstream(UpstreamError::Unreachable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Upstream(UpstreamError::Protocol { .. }) => StatusCode::BAD_GATEWAY,
            ServiceError::Upstream(UpstreamError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match &self.0 {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::UpstreamValidation(_) => "UPSTREAM_METADATA_INVALID",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Forbidden { .. } => "FORBIDDEN",
            ServiceError::NotFound { .. } => "NOT_FOUND",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Upstream(UpstreamError::Unreachable { .. }) => "UPSTREAM_UNREACHABLE",
            ServiceError::Upstream(UpstreamError::Protocol { .. }) => "UPSTREAM_PROTOCOL_ERROR",
            ServiceError::Upstream(UpstreamError::Timeout { .. }) => "UPSTREAM_TIMEOUT",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing text. Never carries storage or transport internals.
    pub fn message(&self) -> String {
        match &self.0 {
            ServiceError::Validation(e) => e.to_string(),
            ServiceError::UpstreamValidation(e) => format!("AI Core returned invalid metadata: {e}"),
            ServiceError::Unauthorized(msg) => msg.clone(),
            ServiceError::Forbidden { what } => format!("Not authorized to access {what}"),
            ServiceError::NotFound { what } => format!("{} not found", capitalize(what)),
            ServiceError::Conflict(msg) => msg.clone(),
            ServiceError::Upstream(UpstreamError::Unreachable { .. }) => {
                "Cannot connect to AI Core".to_string()
            }
            ServiceError::Upstream(UpstreamError::Protocol { status: Some(status), .. }) => {
                format!("AI Core returned HTTP {status}")
            }
            ServiceError::Upstream(UpstreamError::Protocol { status: None, .. }) => {
                "AI Core returned an unexpected response".to_string()
            }
            ServiceError::Upstream(UpstreamError::Timeout { .. }) => {
                "AI Core timed out, please try again".to_string()
            }
            ServiceError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.message(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
