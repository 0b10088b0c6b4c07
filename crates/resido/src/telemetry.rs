use crate::config::{LogFormat, TelemetryConfig};
use crate::ids::RequestId;
use tracing::Span;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level/filter '{value}': unable to build EnvFilter")]
    EnvFilter { value: String, source: ParseError },
    #[error("telemetry error: {0}")]
    Subscriber(Box<dyn std::error::Error + Send + Sync>),
}

pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(&config.log_level).map_err(|source| TelemetryError::EnvFilter {
                value: config.log_level.clone(),
                source,
            })?
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false);

    match config.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .try_init()
            .map_err(TelemetryError::Subscriber),
        LogFormat::Compact => builder
            .compact()
            .try_init()
            .map_err(TelemetryError::Subscriber),
    }
}

/// Span wrapping a single HTTP request.
pub fn request_span(request_id: RequestId, method: &str, path: &str) -> Span {
    tracing::info_span!("request", %request_id, method, path, tenant = tracing::field::Empty)
}

/// Span wrapping a single task execution inside a worker. Carries the request
/// id of the API call that queued the work.
pub fn task_span(request_id: RequestId, task_id: &str, tenant: &str, process_type: &str) -> Span {
    tracing::info_span!("task", %request_id, task_id, tenant, process_type)
}
