use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{Classify, ErrorKind};
use crate::tenancy::{SchemaName, TenantContext};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("no tenant is bound to the current operation")]
    NoTenantContext,
    #[error("{0} data cannot live in the public schema")]
    PublicSchema(&'static str),
}

impl Classify for AccessError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NoTenantContext => ErrorKind::Integrity,
            Self::PublicSchema(_) => ErrorKind::Integrity,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::NoTenantContext => "no_tenant_context",
            Self::PublicSchema(_) => "public_schema_violation",
        }
    }
}

/// Turns an optional binding into a hard requirement.
pub fn require_tenant(ctx: Option<&TenantContext>) -> Result<&TenantContext, AccessError> {
    ctx.ok_or(AccessError::NoTenantContext)
}

/// In-memory stand-in for schema-per-tenant storage: one partition per
/// schema, selected from the bound tenant on every call.
#[derive(Debug)]
pub struct Partitioned<T> {
    entity: &'static str,
    allow_public: bool,
    partitions: Mutex<HashMap<SchemaName, T>>,
}

impl<T: Default> Partitioned<T> {
    /// Partitions for per-tenant data. The public schema is refused.
    pub fn tenant_only(entity: &'static str) -> Self {
        Self {
            entity,
            allow_public: false,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// Partitions that may also hold public-schema reference data.
    pub fn shared(entity: &'static str) -> Self {
        Self {
            entity,
            allow_public: true,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn read<R>(&self, ctx: &TenantContext, f: impl FnOnce(&T) -> R) -> Result<R, AccessError> {
        self.check(ctx)?;
        let guard = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.get(ctx.schema()) {
            Some(partition) => Ok(f(partition)),
            None => Ok(f(&T::default())),
        }
    }

    pub fn write<R>(
        &self,
        ctx: &TenantContext,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, AccessError> {
        self.check(ctx)?;
        let mut guard = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let partition = guard.entry(ctx.schema().clone()).or_default();
        Ok(f(partition))
    }

    fn check(&self, ctx: &TenantContext) -> Result<(), AccessError> {
        if ctx.is_public() && !self.allow_public {
            return Err(AccessError::PublicSchema(self.entity));
        }
        Ok(())
    }
}
