use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::{Classify, ErrorKind};

pub type ApiResult = Result<Response, ApiError>;

#[derive(Serialize)]
struct Envelope<T> {
    status: bool,
    data: T,
}

/// 200 with `data` wrapped in the success envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::OK, data)
}

pub(crate) fn accepted<T: Serialize>(data: T) -> Response {
    with_status(StatusCode::ACCEPTED, data)
}

fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(Envelope { status: true, data })).into_response()
}

/// Error rendered as the failure envelope. Integrity and internal errors
/// are logged here and reach the client only as `internal_error`.
#[derive(Debug, Clone)]
pub struct ApiError {
    kind: ErrorKind,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn feature_disabled(feature: &str) -> Self {
        Self::new(
            ErrorKind::Forbidden,
            "feature_disabled",
            format!("'{feature}' is not part of the tenant's plan"),
        )
    }

    /// Malformed path, query or body.
    pub fn invalid_request(rejection: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Validation, "invalid_payload", rejection.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Internal, "internal_error", err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status_code()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl<E> From<E> for ApiError
where
    E: Classify + std::error::Error,
{
    fn from(err: E) -> Self {
        Self::new(err.kind(), err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self.kind {
            ErrorKind::Integrity | ErrorKind::Internal => {
                tracing::error!(code = self.code, error = %self.message, "request failed");
                ("internal_error", "internal server error".to_string())
            }
            _ => (self.code, self.message),
        };
        let body = Json(json!({
            "status": false,
            "errors": [{ "code": code, "message": message }],
        }));
        (self.kind.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;

    #[test]
    fn classified_errors_keep_their_code_and_status() {
        let err = ApiError::from(AuthError::UserNotFound);
        assert_eq!(err.code(), "user_not_found");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let response = ApiError::internal("lock poisoned at row 7").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
