//! Worker pool draining the task broker.
//!
//! Each worker binds the message's tenant, loads the process, and drives it
//! through Running to a terminal status. Redelivered tasks whose process is
//! already terminal are acknowledged without running the processor again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::Instrument;

use crate::auth::RequestContext;
use crate::error::ErrorKind;
use crate::ids::ProcessId;
use crate::process::{ProcessError, ProcessRegistry, ProcessStatus, ProcessUpdate};
use crate::telemetry;
use crate::tenancy::{TenantContext, TenantResolver};

use super::broker::{Broker, BrokerError, TaskMessage};
use super::processor::{ProcessorError, ProcessorRegistry, RunOutcome};

const IDLE_POLL: Duration = Duration::from_millis(100);
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Everything a worker needs, shared by every worker in a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<ProcessRegistry>,
    pub processors: Arc<ProcessorRegistry>,
    pub resolver: Arc<dyn TenantResolver>,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

pub struct TaskWorker {
    ctx: WorkerContext,
    worker_id: String,
    shutdown_tx: mpsc::Sender<()>,
}

impl TaskWorker {
    pub fn new(ctx: WorkerContext, worker_id: String) -> (Self, mpsc::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        (
            Self {
                ctx,
                worker_id,
                shutdown_tx,
            },
            shutdown_rx,
        )
    }

    /// Polls until a shutdown signal arrives. The task in progress is
    /// finished first.
    pub async fn start(self, mut shutdown_rx: mpsc::Receiver<()>) {
        tracing::info!(worker_id = %self.worker_id, "task worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!(worker_id = %self.worker_id, "shutdown signal received");
                    break;
                }
                result = self.run_once() => {
                    let pause = match result {
                        Ok(Some(_)) => continue,
                        Ok(None) => IDLE_POLL,
                        Err(err) => {
                            tracing::error!(worker_id = %self.worker_id, error = %err, "broker error");
                            ERROR_PAUSE
                        }
                    };
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(pause) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "task worker stopped");
    }

    /// Handles at most one visible message. Returns the process it touched.
    pub async fn run_once(&self) -> Result<Option<ProcessId>, BrokerError> {
        let Some(message) = self.ctx.broker.dequeue().await? else {
            return Ok(None);
        };
        let process_id = message.process_id;
        let task_id = message.task_id;

        self.execute(message).await;
        self.ctx.broker.complete(task_id).await?;
        Ok(Some(process_id))
    }

    async fn execute(&self, message: TaskMessage) {
        let tenant = match self.ctx.resolver.tenant_by_id(message.tenant_id) {
            Ok(tenant) if tenant.is_active() && !tenant.is_public() => tenant,
            Ok(tenant) => {
                tracing::warn!(tenant = %tenant.schema, task_id = %message.task_id, "tenant not runnable; dropping task");
                return;
            }
            Err(err) => {
                tracing::warn!(tenant_id = %message.tenant_id, error = %err, "dropping task for unknown tenant");
                return;
            }
        };

        let scope = self.ctx.resolver.bind(tenant);
        let tenant_ctx = scope.context().clone();
        let span = telemetry::task_span(
            message.request_id,
            &message.task_id.to_string(),
            tenant_ctx.schema().as_str(),
            message.process_type.as_str(),
        );
        self.run_task(&tenant_ctx, &message).instrument(span).await;
        drop(scope);
    }

    async fn run_task(&self, ctx: &TenantContext, message: &TaskMessage) {
        let registry = &self.ctx.registry;
        let process = match registry.get(ctx, message.process_id) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(process_id = %message.process_id, error = %err, "process not loadable; dropping task");
                return;
            }
        };
        if process.status.is_terminal() {
            tracing::debug!(process_id = %process.id, status = %process.status, "process already terminal; skipping");
            return;
        }

        let process = match registry.transition(ctx, process.id, ProcessStatus::Running, ProcessUpdate::default()) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(process_id = %process.id, error = %err, "could not start process");
                return;
            }
        };
        let process = match registry.record_attempt(ctx, process.id) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(process_id = %process.id, error = %err, "could not record attempt");
                process
            }
        };

        let Some(processor) = self.ctx.processors.get(process.process_type) else {
            let err = ProcessorError::new(
                ErrorKind::Integrity,
                "processor_not_registered",
                format!("no processor registered for {}", process.process_type),
            );
            self.finish(ctx, process.id, Err(err));
            return;
        };

        let request = RequestContext::system(ctx.clone(), message.request_id);
        let outcome = processor.run(&request, &process, &message.payload).await;

        match outcome {
            Err(err) if err.is_retryable() && message.attempt < self.ctx.max_attempts => {
                self.retry(ctx, message, err).await;
            }
            outcome => self.finish(ctx, process.id, outcome),
        }
    }

    fn finish(&self, ctx: &TenantContext, id: ProcessId, outcome: Result<RunOutcome, ProcessorError>) {
        let registry = &self.ctx.registry;
        let result = match outcome {
            Ok(RunOutcome::Completed { report }) => {
                registry.update_from_outcome(ctx, id, Some(true), ProcessUpdate::report(report))
            }
            Ok(RunOutcome::Failed {
                error_code,
                error_status,
                error_body,
                report,
            }) => registry.update_from_outcome(
                ctx,
                id,
                Some(false),
                ProcessUpdate {
                    error_code: Some(error_code),
                    error_status: Some(error_status),
                    error_body: Some(error_body),
                    report,
                },
            ),
            Err(err) => {
                if err.kind == ErrorKind::Integrity {
                    tracing::error!(process_id = %id, error = %err, "processor hit an integrity error");
                } else {
                    tracing::warn!(process_id = %id, error = %err, "processor failed");
                }
                registry.update_from_outcome(
                    ctx,
                    id,
                    Some(false),
                    ProcessUpdate::error(err.code, err.status(), err.error_body()),
                )
            }
        };
        log_finish(id, result);
    }

    async fn retry(&self, ctx: &TenantContext, message: &TaskMessage, err: ProcessorError) {
        let registry = &self.ctx.registry;
        let update = ProcessUpdate::error(err.code, err.status(), err.error_body());
        if let Err(mark_err) = registry.transition(ctx, message.process_id, ProcessStatus::Retrying, update) {
            tracing::warn!(process_id = %message.process_id, error = %mark_err, "could not mark process retrying");
            return;
        }

        let backoff = self.ctx.retry_backoff * 2u32.saturating_pow(message.attempt.saturating_sub(1));
        tracing::warn!(
            process_id = %message.process_id,
            attempt = message.attempt,
            backoff_secs = backoff.as_secs(),
            error = %err,
            "processor unavailable; redelivering"
        );
        if let Err(enqueue_err) = self.ctx.broker.enqueue(message.next_attempt(), backoff).await {
            tracing::error!(process_id = %message.process_id, error = %enqueue_err, "redelivery failed");
            self.finish(ctx, message.process_id, Err(enqueue_err.into()));
        }
    }
}

fn log_finish(id: ProcessId, result: Result<crate::process::Process, ProcessError>) {
    match result {
        Ok(process) => tracing::info!(process_id = %id, status = %process.status, "process finished"),
        Err(err) => tracing::warn!(process_id = %id, error = %err, "could not record process outcome"),
    }
}

/// Fixed-size pool of [`TaskWorker`]s.
pub struct WorkerPool {
    workers: Vec<tokio::task::JoinHandle<()>>,
    shutdown_txs: Vec<mpsc::Sender<()>>,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, worker_count: usize) -> Self {
        let mut workers = Vec::new();
        let mut shutdown_txs = Vec::new();

        for index in 0..worker_count.max(1) {
            let (worker, shutdown_rx) = TaskWorker::new(ctx.clone(), format!("worker-{index}"));
            shutdown_txs.push(worker.shutdown_tx.clone());
            workers.push(tokio::spawn(async move {
                worker.start(shutdown_rx).await;
            }));
        }

        Self {
            workers,
            shutdown_txs,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker and waits for in-flight tasks to finish.
    pub async fn shutdown(self) {
        tracing::info!(workers = self.workers.len(), "shutting down worker pool");
        for shutdown_tx in self.shutdown_txs {
            let _ = shutdown_tx.send(()).await;
        }
        for worker in self.workers {
            let _ = worker.await;
        }
        tracing::info!("worker pool shut down");
    }
}
