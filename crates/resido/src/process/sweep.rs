use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::{json, Value};

use crate::auth::RequestContext;
use crate::dispatch::{AsyncProcessor, ProcessorError, RunOutcome};

use super::domain::{Process, ProcessType};
use super::registry::ProcessRegistry;

/// Periodic execution of [`ProcessRegistry::sweep_stale`].
pub struct StaleSweepProcessor {
    registry: Arc<ProcessRegistry>,
    threshold: Duration,
}

impl StaleSweepProcessor {
    pub fn new(registry: Arc<ProcessRegistry>, threshold: Duration) -> Self {
        Self {
            registry,
            threshold,
        }
    }
}

#[async_trait]
impl AsyncProcessor for StaleSweepProcessor {
    fn process_type(&self) -> ProcessType {
        ProcessType::StaleProcessSweep
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        _process: &Process,
        _payload: &Value,
    ) -> Result<RunOutcome, ProcessorError> {
        let swept = self.registry.sweep_stale(ctx.tenant()?, self.threshold)?;
        Ok(RunOutcome::completed(json!({ "swept": swept })))
    }
}
