// HTTP error envelope mapping the domain taxonomy onto status codes.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::AgentTraceError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests {
        message: String,
        retry_after_secs: u64,
    },
    Backpressure {
        retry_after_secs: u64,
    },
    ServiceUnavailable(String),
    Internal(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            Self::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Conflict(msg) => write!(f, "Conflict: {msg}"),
            Self::TooManyRequests { message, .. } => write!(f, "Too many requests: {message}"),
            Self::Backpressure { .. } => {
                write!(f, "Ingest buffer above high-water mark; retry later")
            }
            Self::ServiceUnavailable(msg) => write!(f, "Service unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } | Self::Backpressure { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "validation_failed",
            Self::Unauthorized(_) => "auth_failed",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::TooManyRequests { .. } => "rate_limited",
            Self::Backpressure { .. } => "backpressure",
            Self::ServiceUnavailable(_) => "upstream_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal detail is logged, never surfaced.
        let message = match &self {
            Self::Internal(detail) => {
                tracing::error!(detail, "Internal error surfaced to client");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message,
            },
        });

        let mut response = (status, body).into_response();
        let retry_after = match self {
            Self::TooManyRequests {
                retry_after_secs, ..
            }
            | Self::Backpressure { retry_after_secs } => Some(retry_after_secs),
            _ => None,
        };
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AgentTraceError> for ApiError {
    fn from(err: AgentTraceError) -> Self {
        match err {
            AgentTraceError::Validation(msg) => Self::BadRequest(msg),
            AgentTraceError::PayloadTooLarge { actual, limit } => Self::BadRequest(format!(
                "payload of {actual} bytes exceeds limit of {limit}"
            )),
            AgentTraceError::AuthFailed(msg) => Self::Unauthorized(msg),
            AgentTraceError::ProjectDisabled(project) => {
                Self::Forbidden(format!("project {project} is disabled"))
            }
            AgentTraceError::RateLimited { retry_after_secs } => Self::TooManyRequests {
                message: "rate limit exceeded".into(),
                retry_after_secs,
            },
            AgentTraceError::Backpressure => Self::Backpressure {
                retry_after_secs: 1,
            },
            AgentTraceError::NotFound(what) => Self::NotFound(what),
            AgentTraceError::Conflict(msg) => Self::Conflict(msg),
            AgentTraceError::UpstreamTransient(msg) => Self::ServiceUnavailable(msg),
            AgentTraceError::Database(sqlx::Error::RowNotFound) => {
                Self::NotFound("resource not found".into())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Unauthorized("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::TooManyRequests {
                message: "x".into(),
                retry_after_secs: 5
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_domain_error_mapping() {
        let err: ApiError = AgentTraceError::Backpressure.into();
        assert!(matches!(err, ApiError::Backpressure { .. }));
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_code(), "backpressure");

        let err: ApiError = AgentTraceError::AuthFailed("bad key".into()).into();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let err: ApiError = AgentTraceError::validation("missing field").into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = AgentTraceError::transient("store down").into();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ApiError::BadRequest("x".into()).error_code(), "validation_failed");
        assert_eq!(
            ApiError::TooManyRequests {
                message: "x".into(),
                retry_after_secs: 1
            }
            .error_code(),
            "rate_limited"
        );
    }
}
