use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::events::{DomainEvent, EventBus};
use crate::ids::{ProcessId, RequestId};
use crate::tenancy::TenantContext;

use super::domain::{
    long_running_error_body, NewProcess, Process, ProcessError, ProcessFilter, ProcessStatus,
    ProcessUpdate, ProcessView, PROCESS_TERMINATED_BY_SYSTEM,
};
use super::repository::ProcessRepository;

const DEFAULT_PAGE_SIZE: usize = 25;
const MAX_PAGE_SIZE: usize = 200;
const CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessPage {
    pub items: Vec<ProcessView>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Lifecycle operations over process records. All writes go through the
/// state machine in [`ProcessStatus::can_transition_to`].
pub struct ProcessRegistry {
    repository: Arc<dyn ProcessRepository>,
    events: Arc<EventBus>,
    clock: SharedClock,
}

impl ProcessRegistry {
    pub fn new(
        repository: Arc<dyn ProcessRepository>,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            events,
            clock,
        }
    }

    pub fn create(&self, ctx: &TenantContext, new: NewProcess) -> Result<Process, ProcessError> {
        let now = self.clock.now();
        let process = Process {
            id: ProcessId::new(),
            request_id: new.request_id,
            task_id: None,
            object_id: new.object_id,
            object_name: new.object_name,
            process_type: new.process_type,
            trigger: new.trigger,
            status: ProcessStatus::Queued,
            raw_payload: new.raw_payload,
            report: None,
            error_code: None,
            error_status: None,
            error_body: None,
            periodic_binding: new.periodic_binding,
            active: true,
            attempts: 0,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 0,
        };
        let process = self.repository.insert(ctx, process)?;
        tracing::info!(
            tenant = %ctx.schema(),
            process_id = %process.id,
            process_type = %process.process_type,
            request_id = %process.request_id,
            "process created"
        );
        Ok(process)
    }

    pub fn get(&self, ctx: &TenantContext, id: ProcessId) -> Result<Process, ProcessError> {
        self.repository
            .fetch(ctx, id)?
            .filter(|process| !process.deleted)
            .ok_or(ProcessError::NotFound(id))
    }

    pub fn find_by_request_id(
        &self,
        ctx: &TenantContext,
        request_id: RequestId,
    ) -> Result<Option<Process>, ProcessError> {
        self.repository.find_by_request_id(ctx, request_id)
    }

    /// Attaches the broker task id. Setting the same id twice is a no-op; a
    /// different id is refused.
    pub fn set_task_id(
        &self,
        ctx: &TenantContext,
        id: ProcessId,
        task_id: Uuid,
    ) -> Result<Process, ProcessError> {
        for _ in 0..CONFLICT_RETRIES {
            let mut process = self.get(ctx, id)?;
            match process.task_id {
                Some(existing) if existing == task_id => return Ok(process),
                Some(_) => return Err(ProcessError::TaskIdAlreadySet(id)),
                None => {}
            }
            process.task_id = Some(task_id);
            process.updated_at = self.clock.now();
            match self.repository.update(ctx, process) {
                Err(ProcessError::VersionConflict(_)) => continue,
                other => return other,
            }
        }
        Err(ProcessError::VersionConflict(id))
    }

    pub fn transition(
        &self,
        ctx: &TenantContext,
        id: ProcessId,
        to: ProcessStatus,
        update: ProcessUpdate,
    ) -> Result<Process, ProcessError> {
        self.transition_if(ctx, id, to, update, |_| true)?
            .ok_or(ProcessError::NotFound(id))
    }

    /// Maps a processor result onto a terminal status. `None` leaves the
    /// status untouched and only merges the update.
    pub fn update_from_outcome(
        &self,
        ctx: &TenantContext,
        id: ProcessId,
        succeeded: Option<bool>,
        update: ProcessUpdate,
    ) -> Result<Process, ProcessError> {
        match succeeded {
            Some(true) => self.transition(ctx, id, ProcessStatus::Completed, update),
            Some(false) => self.transition(ctx, id, ProcessStatus::Failed, update),
            None => self.merge(ctx, id, update),
        }
    }

    /// Counts one more execution attempt.
    pub fn record_attempt(&self, ctx: &TenantContext, id: ProcessId) -> Result<Process, ProcessError> {
        for _ in 0..CONFLICT_RETRIES {
            let mut process = self.get(ctx, id)?;
            process.attempts += 1;
            process.updated_at = self.clock.now();
            match self.repository.update(ctx, process) {
                Err(ProcessError::VersionConflict(_)) => continue,
                other => return other,
            }
        }
        Err(ProcessError::VersionConflict(id))
    }

    /// Operator-initiated stop.
    pub fn cancel(&self, ctx: &RequestContext, id: ProcessId) -> Result<Process, ProcessError> {
        let tenant = ctx.tenant()?;
        let process = self.visible(ctx, id)?;
        self.transition(
            tenant,
            process.id,
            ProcessStatus::Canceled,
            ProcessUpdate {
                report: Some(serde_json::json!({ "canceled_by": ctx.actor() })),
                ..ProcessUpdate::default()
            },
        )
    }

    pub fn sweep_stale(&self, ctx: &TenantContext, threshold: Duration) -> Result<usize, ProcessError> {
        self.sweep_stale_at(ctx, threshold, self.clock.now())
    }

    /// Fails every Running process not touched within `threshold` of `now`.
    /// Processes that finish concurrently are left alone, so repeated sweeps
    /// converge.
    pub fn sweep_stale_at(
        &self,
        ctx: &TenantContext,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, ProcessError> {
        let cutoff = now - threshold;
        let mut swept = 0;
        for candidate in self.repository.running_updated_before(ctx, cutoff)? {
            let update = ProcessUpdate::error(
                PROCESS_TERMINATED_BY_SYSTEM,
                400,
                long_running_error_body(),
            );
            let result = self.transition_if(ctx, candidate.id, ProcessStatus::Failed, update, |process| {
                process.status == ProcessStatus::Running && process.updated_at < cutoff
            });
            match result {
                Ok(Some(_)) => swept += 1,
                Ok(None) | Err(ProcessError::AlreadyTerminal { .. }) => {}
                Err(ProcessError::VersionConflict(_)) => {
                    tracing::debug!(process_id = %candidate.id, "stale sweep lost a race; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        if swept > 0 {
            tracing::warn!(tenant = %ctx.schema(), swept, "stale processes terminated");
        }
        Ok(swept)
    }

    /// Filtered, row-level restricted, newest-first page of processes.
    pub fn list(&self, ctx: &RequestContext, filter: &ProcessFilter) -> Result<ProcessPage, ProcessError> {
        let tenant = ctx.tenant()?;
        let rows = ctx.row_filter().apply(self.repository.list(tenant, filter)?);
        let page_size = filter
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let page = filter.page.unwrap_or(1).max(1);
        let total = rows.len();
        let items = rows
            .iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(Process::view)
            .collect();
        Ok(ProcessPage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub fn detail(&self, ctx: &RequestContext, id: ProcessId) -> Result<ProcessView, ProcessError> {
        Ok(self.visible(ctx, id)?.view())
    }

    fn visible(&self, ctx: &RequestContext, id: ProcessId) -> Result<Process, ProcessError> {
        let process = self.get(ctx.tenant()?, id)?;
        if ctx.row_filter().permits(&process) {
            Ok(process)
        } else {
            Err(ProcessError::NotFound(id))
        }
    }

    fn merge(&self, ctx: &TenantContext, id: ProcessId, update: ProcessUpdate) -> Result<Process, ProcessError> {
        for _ in 0..CONFLICT_RETRIES {
            let mut process = self.get(ctx, id)?;
            apply(&mut process, update.clone());
            process.updated_at = self.clock.now();
            match self.repository.update(ctx, process) {
                Err(ProcessError::VersionConflict(_)) => continue,
                other => return other,
            }
        }
        Err(ProcessError::VersionConflict(id))
    }

    /// Moves `id` to `to` when `guard` holds on the freshly read record.
    /// Returns `Ok(None)` when the guard rejects it. A same-status request
    /// returns the record unchanged.
    fn transition_if(
        &self,
        ctx: &TenantContext,
        id: ProcessId,
        to: ProcessStatus,
        update: ProcessUpdate,
        guard: impl Fn(&Process) -> bool,
    ) -> Result<Option<Process>, ProcessError> {
        for _ in 0..CONFLICT_RETRIES {
            let mut process = self.get(ctx, id)?;
            if !guard(&process) {
                return Ok(None);
            }
            let from = process.status;
            if from == to {
                return Ok(Some(process));
            }
            if from.is_terminal() {
                return Err(ProcessError::AlreadyTerminal { id, status: from });
            }
            if !from.can_transition_to(to) {
                return Err(ProcessError::InvalidTransition { from, to });
            }

            process.status = to;
            if to.is_terminal() {
                process.active = false;
            }
            apply(&mut process, update.clone());
            process.updated_at = self.clock.now();

            match self.repository.update(ctx, process) {
                Ok(process) => {
                    tracing::info!(
                        tenant = %ctx.schema(),
                        process_id = %process.id,
                        from = %from,
                        to = %to,
                        "process transitioned"
                    );
                    self.events.publish(
                        ctx,
                        DomainEvent::ProcessTransitioned {
                            process_id: process.id,
                            process_type: process.process_type,
                            object_id: process.object_id.clone(),
                            from,
                            to,
                            request_id: process.request_id,
                        },
                    );
                    return Ok(Some(process));
                }
                Err(ProcessError::VersionConflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(ProcessError::VersionConflict(id))
    }
}

fn apply(process: &mut Process, update: ProcessUpdate) {
    if let Some(code) = update.error_code {
        process.error_code = Some(code);
    }
    if let Some(status) = update.error_status {
        process.error_status = Some(status);
    }
    if let Some(body) = update.error_body {
        process.error_body = Some(body);
    }
    if let Some(report) = update.report {
        process.report = Some(merge_report(process.report.take(), report));
    }
}

fn merge_report(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut base)), Value::Object(extra)) => {
            base.extend(extra);
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}
