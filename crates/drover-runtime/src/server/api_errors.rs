//! HTTP error mapping for the task and job handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use drover_kernel::{ErrorKind, KernelError};

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    Forbidden(ErrorState),
    NotFound(ErrorState),
    Conflict(ErrorState),
    /// The caller does not hold the lease it reported against.
    ExpectationFailed(ErrorState),
    Internal(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorState::new(message))
    }

    pub fn expectation_failed(message: impl Into<String>) -> Self {
        Self::ExpectationFailed(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::Forbidden(s)
            | Self::NotFound(s)
            | Self::Conflict(s)
            | Self::ExpectationFailed(s)
            | Self::Internal(s) => s,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }
}

impl From<KernelError> for ApiError {
    fn from(err: KernelError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => Self::bad_request(message),
            ErrorKind::NotFound => Self::not_found(message),
            ErrorKind::Forbidden => Self::forbidden(message),
            ErrorKind::Conflict => Self::conflict(message),
            ErrorKind::LeaseMismatch => Self::expectation_failed(message),
            ErrorKind::Config | ErrorKind::Storage => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, state) = match self {
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, "invalid_argument", s),
            Self::Forbidden(s) => (StatusCode::FORBIDDEN, "forbidden", s),
            Self::NotFound(s) => (StatusCode::NOT_FOUND, "not_found", s),
            Self::Conflict(s) => (StatusCode::CONFLICT, "conflict", s),
            Self::ExpectationFailed(s) => (StatusCode::EXPECTATION_FAILED, "lease_mismatch", s),
            Self::Internal(s) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", s),
        };
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code,
                message: state.message,
                details: state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_kinds_map_to_status_codes() {
        let cases = [
            (KernelError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (KernelError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (KernelError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (KernelError::Conflict("x".into()), StatusCode::CONFLICT),
            (KernelError::LeaseMismatch("x".into()), StatusCode::EXPECTATION_FAILED),
            (KernelError::Store("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }
}
