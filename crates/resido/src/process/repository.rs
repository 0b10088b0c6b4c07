use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access::Partitioned;
use crate::ids::{ProcessId, RequestId};
use crate::tenancy::TenantContext;

use super::domain::{Process, ProcessError, ProcessFilter, ProcessStatus};

/// Storage seam for process records. Every call is bound to one tenant.
pub trait ProcessRepository: Send + Sync {
    /// Stores a new record, enforcing request id uniqueness and at most one
    /// non-terminal process per object and type.
    fn insert(&self, ctx: &TenantContext, process: Process) -> Result<Process, ProcessError>;

    /// Replaces a record whose stored version equals `process.version`; the
    /// stored copy gets the next version.
    fn update(&self, ctx: &TenantContext, process: Process) -> Result<Process, ProcessError>;

    fn fetch(&self, ctx: &TenantContext, id: ProcessId) -> Result<Option<Process>, ProcessError>;

    fn find_by_request_id(
        &self,
        ctx: &TenantContext,
        request_id: RequestId,
    ) -> Result<Option<Process>, ProcessError>;

    /// Matching records, newest first.
    fn list(&self, ctx: &TenantContext, filter: &ProcessFilter) -> Result<Vec<Process>, ProcessError>;

    /// Running processes last touched before `cutoff`.
    fn running_updated_before(
        &self,
        ctx: &TenantContext,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Process>, ProcessError>;
}

#[derive(Debug, Default)]
struct ProcessPartition {
    by_id: HashMap<ProcessId, Process>,
    by_request: HashMap<RequestId, ProcessId>,
    by_task: HashMap<Uuid, ProcessId>,
}

impl ProcessPartition {
    fn in_flight_for(&self, process: &Process) -> bool {
        let Some(object_id) = process.object_id.as_ref() else {
            return false;
        };
        self.by_id.values().any(|existing| {
            existing.id != process.id
                && existing.process_type == process.process_type
                && existing.object_id.as_ref() == Some(object_id)
                && !existing.status.is_terminal()
                && !existing.deleted
        })
    }
}

pub struct InMemoryProcessRepository {
    partitions: Partitioned<ProcessPartition>,
}

impl Default for InMemoryProcessRepository {
    fn default() -> Self {
        Self {
            partitions: Partitioned::tenant_only("process"),
        }
    }
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessRepository for InMemoryProcessRepository {
    fn insert(&self, ctx: &TenantContext, process: Process) -> Result<Process, ProcessError> {
        self.partitions.write(ctx, |partition| {
            if partition.by_request.contains_key(&process.request_id) {
                return Err(ProcessError::DuplicateRequest(process.request_id));
            }
            if let Some(task_id) = process.task_id {
                if partition.by_task.contains_key(&task_id) {
                    return Err(ProcessError::DuplicateTaskId(task_id));
                }
            }
            if !process.status.is_terminal() && partition.in_flight_for(&process) {
                return Err(ProcessError::NonTerminalExists {
                    object_id: process.object_id.clone().unwrap_or_default(),
                    process_type: process.process_type,
                });
            }

            partition.by_request.insert(process.request_id, process.id);
            if let Some(task_id) = process.task_id {
                partition.by_task.insert(task_id, process.id);
            }
            partition.by_id.insert(process.id, process.clone());
            Ok(process)
        })?
    }

    fn update(&self, ctx: &TenantContext, mut process: Process) -> Result<Process, ProcessError> {
        self.partitions.write(ctx, |partition| {
            let stored = partition
                .by_id
                .get(&process.id)
                .ok_or(ProcessError::NotFound(process.id))?;
            if stored.version != process.version {
                return Err(ProcessError::VersionConflict(process.id));
            }
            if let Some(task_id) = process.task_id {
                match partition.by_task.get(&task_id) {
                    Some(owner) if *owner != process.id => {
                        return Err(ProcessError::DuplicateTaskId(task_id));
                    }
                    _ => {}
                }
            }
            if stored.status.is_terminal()
                && !process.status.is_terminal()
                && partition.in_flight_for(&process)
            {
                return Err(ProcessError::NonTerminalExists {
                    object_id: process.object_id.clone().unwrap_or_default(),
                    process_type: process.process_type,
                });
            }

            if let Some(task_id) = process.task_id {
                partition.by_task.insert(task_id, process.id);
            }
            process.version += 1;
            partition.by_id.insert(process.id, process.clone());
            Ok(process)
        })?
    }

    fn fetch(&self, ctx: &TenantContext, id: ProcessId) -> Result<Option<Process>, ProcessError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.by_id.get(&id).cloned())?)
    }

    fn find_by_request_id(
        &self,
        ctx: &TenantContext,
        request_id: RequestId,
    ) -> Result<Option<Process>, ProcessError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .by_request
                .get(&request_id)
                .and_then(|id| partition.by_id.get(id))
                .cloned()
        })?)
    }

    fn list(&self, ctx: &TenantContext, filter: &ProcessFilter) -> Result<Vec<Process>, ProcessError> {
        let mut rows = self.partitions.read(ctx, |partition| {
            partition
                .by_id
                .values()
                .filter(|process| filter.matches(process))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    fn running_updated_before(
        &self,
        ctx: &TenantContext,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Process>, ProcessError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .by_id
                .values()
                .filter(|process| {
                    process.status == ProcessStatus::Running
                        && process.updated_at < cutoff
                        && !process.deleted
                })
                .cloned()
                .collect()
        })?)
    }
}
