use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::access::{AccessError, Partitioned};
use crate::clock::SharedClock;
use crate::events::{DomainEvent, EventError, EventSubscriber};
use crate::tenancy::TenantContext;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub event: DomainEvent,
}

/// Append-only audit trail fed from the event bus.
pub struct AuditTrail {
    entries: Partitioned<Vec<AuditEntry>>,
    clock: SharedClock,
}

impl AuditTrail {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Partitioned::tenant_only("audit"),
            clock,
        }
    }

    pub fn entries(&self, ctx: &TenantContext) -> Result<Vec<AuditEntry>, AccessError> {
        self.entries.read(ctx, |entries| entries.clone())
    }
}

impl EventSubscriber for AuditTrail {
    fn name(&self) -> &'static str {
        "audit_trail"
    }

    fn handle(&self, ctx: &TenantContext, event: &DomainEvent) -> Result<(), EventError> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            recorded_at: self.clock.now(),
            event: event.clone(),
        };
        self.entries
            .write(ctx, |entries| entries.push(entry))
            .map_err(|err| EventError {
                subscriber: "audit_trail",
                message: err.to_string(),
            })
    }
}
