use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::access::Partitioned;
use crate::ids::NotificationId;
use crate::tenancy::TenantContext;

use super::domain::{NotificationEntry, NotificationError, NotificationStatus};

pub trait NotificationStore: Send + Sync {
    fn insert(&self, ctx: &TenantContext, entry: NotificationEntry) -> Result<NotificationEntry, NotificationError>;
    /// Fails with [`NotificationError::VersionConflict`] when the stored row
    /// moved on; bumps the version otherwise.
    fn update(&self, ctx: &TenantContext, entry: NotificationEntry) -> Result<NotificationEntry, NotificationError>;
    fn get(&self, ctx: &TenantContext, id: NotificationId) -> Result<Option<NotificationEntry>, NotificationError>;
    /// Pending rows whose next attempt is due, plus Queued rows last touched
    /// before `reclaim_before`, ordered by `(priority, next_attempt_at)`.
    fn due(
        &self,
        ctx: &TenantContext,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<NotificationEntry>, NotificationError>;
    fn list(&self, ctx: &TenantContext) -> Result<Vec<NotificationEntry>, NotificationError>;
}

pub struct InMemoryNotificationStore {
    partitions: Partitioned<HashMap<NotificationId, NotificationEntry>>,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self {
            partitions: Partitioned::tenant_only("notification"),
        }
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationStore for InMemoryNotificationStore {
    fn insert(&self, ctx: &TenantContext, entry: NotificationEntry) -> Result<NotificationEntry, NotificationError> {
        Ok(self.partitions.write(ctx, |rows| {
            rows.insert(entry.id, entry.clone());
            entry
        })?)
    }

    fn update(&self, ctx: &TenantContext, mut entry: NotificationEntry) -> Result<NotificationEntry, NotificationError> {
        self.partitions.write(ctx, |rows| {
            let stored = rows.get_mut(&entry.id).ok_or(NotificationError::NotFound(entry.id))?;
            if stored.version != entry.version {
                return Err(NotificationError::VersionConflict(entry.id));
            }
            entry.version += 1;
            *stored = entry.clone();
            Ok(entry)
        })?
    }

    fn get(&self, ctx: &TenantContext, id: NotificationId) -> Result<Option<NotificationEntry>, NotificationError> {
        Ok(self.partitions.read(ctx, |rows| rows.get(&id).cloned())?)
    }

    fn due(
        &self,
        ctx: &TenantContext,
        now: DateTime<Utc>,
        reclaim_before: DateTime<Utc>,
    ) -> Result<Vec<NotificationEntry>, NotificationError> {
        let mut rows = self.partitions.read(ctx, |rows| {
            rows.values()
                .filter(|entry| match entry.status {
                    NotificationStatus::Pending => entry.next_attempt_at <= now,
                    NotificationStatus::Queued => entry.updated_at < reclaim_before,
                    NotificationStatus::Sent | NotificationStatus::Failed => false,
                })
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.next_attempt_at.cmp(&b.next_attempt_at))
        });
        Ok(rows)
    }

    fn list(&self, ctx: &TenantContext) -> Result<Vec<NotificationEntry>, NotificationError> {
        let mut rows = self
            .partitions
            .read(ctx, |rows| rows.values().cloned().collect::<Vec<_>>())?;
        rows.sort_by_key(|entry| entry.created_at);
        Ok(rows)
    }
}
