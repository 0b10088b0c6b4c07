use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::clock::SharedClock;
use crate::ids::{PeriodicBindingId, RequestId, TenantId};
use crate::process::{NewProcess, ProcessError, ProcessType, Trigger};
use crate::tenancy::TenantDirectory;

use super::dispatcher::{DispatchError, TaskDispatcher};

/// Periodic work a tenant can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCode {
    TransactionsReconciliation,
    NotificationDelivery,
    StaleProcessSweep,
}

impl TaskCode {
    pub const ALL: [TaskCode; 3] = [
        Self::TransactionsReconciliation,
        Self::NotificationDelivery,
        Self::StaleProcessSweep,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransactionsReconciliation => "transactions_reconciliation",
            Self::NotificationDelivery => "notification_delivery",
            Self::StaleProcessSweep => "stale_process_sweep",
        }
    }

    pub const fn process_type(self) -> ProcessType {
        match self {
            Self::TransactionsReconciliation => ProcessType::TransactionsReconciliation,
            Self::NotificationDelivery => ProcessType::NotificationDelivery,
            Self::StaleProcessSweep => ProcessType::StaleProcessSweep,
        }
    }
}

impl fmt::Display for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodicBinding {
    pub id: PeriodicBindingId,
    pub tenant_id: TenantId,
    pub task_code: TaskCode,
    pub interval: Duration,
    pub enabled: bool,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PeriodicBinding {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match (self.last_enqueued_at, chrono::Duration::from_std(self.interval)) {
            (None, _) => true,
            (Some(last), Ok(interval)) => now - last >= interval,
            (Some(_), Err(_)) => false,
        }
    }
}

/// Intervals used when seeding a tenant's periodic bindings.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleIntervals {
    pub reconciliation: Duration,
    pub notifications: Duration,
    pub sweep: Duration,
}

impl ScheduleIntervals {
    fn for_code(&self, code: TaskCode) -> Duration {
        match code {
            TaskCode::TransactionsReconciliation => self.reconciliation,
            TaskCode::NotificationDelivery => self.notifications,
            TaskCode::StaleProcessSweep => self.sweep,
        }
    }
}

/// The single table of periodic bindings, keyed by `(tenant, task code)`.
pub struct PeriodicTable {
    bindings: RwLock<HashMap<(TenantId, TaskCode), PeriodicBinding>>,
    clock: SharedClock,
}

impl PeriodicTable {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Creates the binding or updates its interval. Existing bindings keep
    /// their id and schedule.
    pub fn upsert(&self, tenant_id: TenantId, task_code: TaskCode, interval: Duration) -> PeriodicBinding {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let binding = bindings
            .entry((tenant_id, task_code))
            .and_modify(|binding| binding.interval = interval)
            .or_insert_with(|| PeriodicBinding {
                id: PeriodicBindingId::new(),
                tenant_id,
                task_code,
                interval,
                enabled: true,
                last_enqueued_at: None,
                created_at: now,
            });
        binding.clone()
    }

    pub fn set_enabled(&self, tenant_id: TenantId, task_code: TaskCode, enabled: bool) -> Option<PeriodicBinding> {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        bindings.get_mut(&(tenant_id, task_code)).map(|binding| {
            binding.enabled = enabled;
            binding.clone()
        })
    }

    pub fn for_tenant(&self, tenant_id: TenantId) -> Vec<PeriodicBinding> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<_> = bindings
            .values()
            .filter(|binding| binding.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|binding| binding.task_code);
        rows
    }

    fn mark_enqueued(&self, tenant_id: TenantId, task_code: TaskCode, at: DateTime<Utc>) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = bindings.get_mut(&(tenant_id, task_code)) {
            binding.last_enqueued_at = Some(at);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enqueued: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Turns due periodic bindings into Periodic processes. Work itself always
/// runs on the worker pool.
pub struct Scheduler {
    table: Arc<PeriodicTable>,
    directory: Arc<TenantDirectory>,
    dispatcher: Arc<TaskDispatcher>,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(
        table: Arc<PeriodicTable>,
        directory: Arc<TenantDirectory>,
        dispatcher: Arc<TaskDispatcher>,
        clock: SharedClock,
    ) -> Self {
        Self {
            table,
            directory,
            dispatcher,
            clock,
        }
    }

    pub fn table(&self) -> &Arc<PeriodicTable> {
        &self.table
    }

    /// Binds every periodic task code to `tenant_id`.
    pub fn seed_tenant_tasks(&self, tenant_id: TenantId, intervals: ScheduleIntervals) -> Vec<PeriodicBinding> {
        TaskCode::ALL
            .into_iter()
            .map(|code| self.table.upsert(tenant_id, code, intervals.for_code(code)))
            .collect()
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = self.clock.now();

        for tenant in self.directory.iter_active_tenants() {
            let due: Vec<_> = self
                .table
                .for_tenant(tenant.id)
                .into_iter()
                .filter(|binding| binding.is_due(now))
                .collect();
            if due.is_empty() {
                continue;
            }

            let scope = self.directory.bind(tenant.clone());
            for binding in due {
                let new = NewProcess {
                    process_type: binding.task_code.process_type(),
                    request_id: RequestId::new(),
                    object_id: Some(binding.id.to_string()),
                    object_name: Some(binding.task_code.as_str().to_string()),
                    trigger: Trigger::Periodic,
                    raw_payload: None,
                    periodic_binding: Some(binding.id),
                    created_by: Some("scheduler".to_string()),
                };
                match self.dispatcher.submit(scope.context(), new).await {
                    Ok(_) => {
                        self.table.mark_enqueued(tenant.id, binding.task_code, now);
                        report.enqueued += 1;
                    }
                    Err(DispatchError::Process(ProcessError::NonTerminalExists { .. })) => {
                        tracing::debug!(tenant = %tenant.schema, task = %binding.task_code, "previous run still in flight");
                        report.skipped += 1;
                    }
                    Err(err) => {
                        tracing::warn!(tenant = %tenant.schema, task = %binding.task_code, error = %err, "periodic enqueue failed");
                        report.failed += 1;
                    }
                }
            }
        }

        if report != TickReport::default() {
            tracing::info!(
                enqueued = report.enqueued,
                skipped = report.skipped,
                failed = report.failed,
                "scheduler tick"
            );
        }
        report
    }

    /// Ticks every `period` until shutdown.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        tracing::info!("scheduler stopped");
    }
}
