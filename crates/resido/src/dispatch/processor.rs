use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::RequestContext;
use crate::error::{Classify, ErrorKind};
use crate::process::{Process, ProcessType};

/// Result of one processor run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        report: Value,
    },
    Failed {
        error_code: String,
        error_status: u16,
        error_body: Value,
        report: Option<Value>,
    },
}

impl RunOutcome {
    pub fn completed(report: Value) -> Self {
        Self::Completed { report }
    }

    pub fn failed(code: &str, status: u16, message: &str, report: Option<Value>) -> Self {
        Self::Failed {
            error_code: code.to_string(),
            error_status: status,
            error_body: error_body(code, message),
            report,
        }
    }

    /// Renders a processor report for storage on the process.
    pub fn report_value<T: Serialize>(report: &T) -> Result<Value, ProcessorError> {
        serde_json::to_value(report)
            .map_err(|err| ProcessorError::new(ErrorKind::Internal, "report_not_serializable", err.to_string()))
    }
}

/// Error escaping a processor. Unavailable errors are redelivered up to the
/// attempt ceiling; every other kind is terminal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProcessorError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl ProcessorError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "invalid_payload", message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn status(&self) -> u16 {
        self.kind.status_code().as_u16()
    }

    pub fn error_body(&self) -> Value {
        error_body(self.code, &self.message)
    }
}

impl<E> From<E> for ProcessorError
where
    E: Classify + std::error::Error,
{
    fn from(err: E) -> Self {
        Self::new(err.kind(), err.code(), err.to_string())
    }
}

fn error_body(code: &str, message: &str) -> Value {
    json!({
        "status": false,
        "errors": [{ "code": code, "message": message }],
    })
}

/// Business logic behind one process type.
#[async_trait]
pub trait AsyncProcessor: Send + Sync {
    fn process_type(&self) -> ProcessType;

    /// Must be idempotent per (tenant, object, process type): the broker may
    /// deliver the same task more than once.
    async fn run(
        &self,
        ctx: &RequestContext,
        process: &Process,
        payload: &Value,
    ) -> Result<RunOutcome, ProcessorError>;
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<ProcessType, Arc<dyn AsyncProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn AsyncProcessor>) -> &mut Self {
        self.processors.insert(processor.process_type(), processor);
        self
    }

    pub fn get(&self, process_type: ProcessType) -> Option<Arc<dyn AsyncProcessor>> {
        self.processors.get(&process_type).cloned()
    }

    pub fn registered(&self) -> Vec<ProcessType> {
        let mut types: Vec<_> = self.processors.keys().copied().collect();
        types.sort_by_key(|kind| kind.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::BrokerError;

    #[test]
    fn classified_errors_keep_their_kind_and_code() {
        let err: ProcessorError = BrokerError::Unavailable("down".into()).into();
        assert!(err.is_retryable());
        assert_eq!(err.code, "broker_unavailable");
        assert_eq!(err.status(), 503);
        assert_eq!(err.error_body()["errors"][0]["code"], "broker_unavailable");

        assert!(!ProcessorError::invalid_payload("missing bill").is_retryable());
    }

    #[test]
    fn unserializable_reports_surface_as_internal_errors() {
        let report = HashMap::from([((1, 2), "tuple keys are not json")]);
        let err = RunOutcome::report_value(&report).expect_err("non-string map keys");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.code, "report_not_serializable");

        let body = RunOutcome::report_value(&json!({ "examined": 3 })).expect("plain report");
        assert_eq!(body["examined"], 3);
    }
}
