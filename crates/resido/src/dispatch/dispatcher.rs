use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::DispatcherConfig;
use crate::error::{Classify, ErrorKind};
use crate::process::{NewProcess, Process, ProcessError, ProcessRegistry, ProcessStatus, ProcessUpdate};
use crate::tenancy::TenantContext;

use super::broker::{Broker, BrokerError, TaskMessage};

/// Countdown floor that lets the caller finish its own writes before a
/// worker can pick the task up.
pub const MIN_COUNTDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Classify for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Process(err) => err.kind(),
            Self::Broker(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Process(err) => err.code(),
            Self::Broker(err) => err.code(),
        }
    }
}

/// Creates process records and hands them to the broker.
pub struct TaskDispatcher {
    registry: Arc<ProcessRegistry>,
    broker: Arc<dyn Broker>,
    countdown: Duration,
}

impl TaskDispatcher {
    pub fn new(registry: Arc<ProcessRegistry>, broker: Arc<dyn Broker>, config: &DispatcherConfig) -> Self {
        Self {
            registry,
            broker,
            countdown: config.countdown.max(MIN_COUNTDOWN),
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Records a Queued process and enqueues it. The process id is returned
    /// to the caller before any worker can run it.
    pub async fn submit(&self, ctx: &TenantContext, new: NewProcess) -> Result<Process, DispatchError> {
        let process = self.registry.create(ctx, new)?;
        self.enqueue(ctx, process).await
    }

    /// Enqueues an existing Queued process. A broker failure fails the
    /// process so it does not linger in Queued.
    pub async fn enqueue(&self, ctx: &TenantContext, process: Process) -> Result<Process, DispatchError> {
        let message = TaskMessage::for_process(ctx.tenant_id(), &process);
        let task_id = message.task_id;

        if let Err(err) = self.broker.enqueue(message, self.countdown).await {
            tracing::error!(
                tenant = %ctx.schema(),
                process_id = %process.id,
                error = %err,
                "failed to enqueue process"
            );
            let update = ProcessUpdate::error(
                err.code(),
                err.kind().status_code().as_u16(),
                json!({
                    "status": false,
                    "errors": [{ "code": err.code(), "message": err.to_string() }],
                }),
            );
            if let Err(mark_err) = self
                .registry
                .transition(ctx, process.id, ProcessStatus::Failed, update)
            {
                tracing::warn!(process_id = %process.id, error = %mark_err, "could not fail unenqueued process");
            }
            return Err(err.into());
        }

        let process = self.registry.set_task_id(ctx, process.id, task_id)?;
        tracing::info!(
            tenant = %ctx.schema(),
            process_id = %process.id,
            task_id = %task_id,
            countdown_secs = self.countdown.as_secs(),
            "process enqueued"
        );
        Ok(process)
    }
}
