use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::domain::{SchemaName, Tenant};
use crate::ids::TenantId;

/// Proof that a tenant binding is held. Repositories only accept work that
/// carries one of these, which fixes the schema every query runs against.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant: Arc<Tenant>,
}

impl TenantContext {
    pub(crate) fn new(tenant: Arc<Tenant>) -> Self {
        Self { tenant }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant.id
    }

    pub fn schema(&self) -> &SchemaName {
        &self.tenant.schema
    }

    pub fn is_public(&self) -> bool {
        self.tenant.is_public()
    }
}

/// Guard returned when a tenant is bound. The binding is released when the
/// guard drops, including on early return, error and unwinding.
#[derive(Debug)]
pub struct TenantScope {
    context: TenantContext,
    active: Arc<AtomicUsize>,
}

impl TenantScope {
    pub(crate) fn acquire(tenant: Arc<Tenant>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(tenant = %tenant.schema, "tenant bound");
        Self {
            context: TenantContext::new(tenant),
            active,
        }
    }

    pub fn context(&self) -> &TenantContext {
        &self.context
    }
}

impl Drop for TenantScope {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(tenant = %self.context.schema(), "tenant released");
    }
}
