use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::telemetry::TelemetryError;
use crate::tenancy::TenancyError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Coarse error categories shared by every component.
///
/// The HTTP layer maps kinds onto status codes and the task worker maps them
/// onto terminal vs retryable outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    Forbidden,
    Validation,
    Conflict,
    NotFound,
    Unavailable,
    Integrity,
    Internal,
}

impl ErrorKind {
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Authorization => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Conflict => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Integrity | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an async processor failing with this kind may be redelivered.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Implemented by every domain error so callers can classify without matching.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Stable snake_case code exposed to API clients and stored in error bodies.
    fn code(&self) -> &'static str;
}

/// Errors raised while bootstrapping or serving the application.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("tenant error: {0}")]
    Tenancy(#[from] TenancyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(#[from] axum::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "unhandled application error");
        let body = Json(json!({
            "status": false,
            "errors": [{ "code": "internal_error", "message": self.to_string() }],
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
