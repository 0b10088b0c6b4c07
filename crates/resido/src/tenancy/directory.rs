use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::binding::{TenantContext, TenantScope};
use super::domain::{NewTenant, SchemaName, Tenant, TenantState, TenancyError};
use crate::clock::SharedClock;
use crate::ids::TenantId;

/// Reserved path always served by the public tenant, whatever the host.
pub const VERSIONS_PATH: &str = "/versions";

/// Lookup seam used by the auth layer and the worker so neither depends on
/// the concrete directory.
pub trait TenantResolver: Send + Sync {
    fn resolve_for_request(&self, host: &str, path: &str) -> Result<Arc<Tenant>, TenancyError>;
    fn tenant_by_id(&self, id: TenantId) -> Result<Arc<Tenant>, TenancyError>;
    fn bind(&self, tenant: Arc<Tenant>) -> TenantScope;
}

type HostIndex = Arc<HashMap<String, Arc<Tenant>>>;

/// Public-schema registry of tenants with a memoised host index.
pub struct TenantDirectory {
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
    host_index: RwLock<Option<HostIndex>>,
    index_builds: AtomicUsize,
    active_bindings: Arc<AtomicUsize>,
    public_id: TenantId,
    clock: SharedClock,
}

impl TenantDirectory {
    /// Creates a directory holding only the public tenant.
    pub fn new(public_domain: &str, clock: SharedClock) -> Self {
        let now = clock.now();
        let public = Tenant {
            id: TenantId::new(),
            schema: SchemaName::public(),
            domain: normalize_host(public_domain),
            name: "Public".to_string(),
            state: TenantState::Active,
            created_at: now,
            updated_at: now,
        };
        let public_id = public.id;
        let mut tenants = HashMap::new();
        tenants.insert(public_id, Arc::new(public));

        Self {
            tenants: RwLock::new(tenants),
            host_index: RwLock::new(None),
            index_builds: AtomicUsize::new(0),
            active_bindings: Arc::new(AtomicUsize::new(0)),
            public_id,
            clock,
        }
    }

    pub fn public_tenant(&self) -> Result<Arc<Tenant>, TenancyError> {
        self.tenant_by_id(self.public_id)
    }

    /// Registers a tenant. Schema and domain must be unique across the directory.
    pub fn provision(&self, request: NewTenant) -> Result<Arc<Tenant>, TenancyError> {
        let schema = SchemaName::new(request.schema)?;
        let domain = normalize_host(&request.domain);
        let now = self.clock.now();

        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        if tenants.values().any(|tenant| tenant.schema == schema) {
            return Err(TenancyError::DuplicateSchema(schema.to_string()));
        }
        if tenants.values().any(|tenant| tenant.domain == domain) {
            return Err(TenancyError::DuplicateDomain(domain));
        }

        let tenant = Arc::new(Tenant {
            id: TenantId::new(),
            schema,
            domain,
            name: request.name,
            state: request.state,
            created_at: now,
            updated_at: now,
        });
        tenants.insert(tenant.id, tenant.clone());
        drop(tenants);

        self.invalidate();
        tracing::info!(tenant = %tenant.schema, domain = %tenant.domain, "tenant provisioned");
        Ok(tenant)
    }

    /// Moves a tenant between lifecycle states. The schema is never changed.
    pub fn set_state(&self, id: TenantId, state: TenantState) -> Result<Arc<Tenant>, TenancyError> {
        let mut tenants = self.tenants.write().unwrap_or_else(PoisonError::into_inner);
        let current = tenants.get(&id).ok_or(TenancyError::UnknownTenant(id))?;
        let mut updated = Tenant::clone(current);
        updated.state = state;
        updated.updated_at = self.clock.now();
        let updated = Arc::new(updated);
        tenants.insert(id, updated.clone());
        drop(tenants);

        self.invalidate();
        Ok(updated)
    }

    pub fn resolve_tenant_by_host(&self, host: &str) -> Result<Arc<Tenant>, TenancyError> {
        let host = normalize_host(host);
        let index = self.host_index();
        index
            .get(&host)
            .cloned()
            .ok_or(TenancyError::HostNotFound(host))
    }

    /// Active tenant schemas, public excluded, in schema order.
    pub fn iter_active_tenants(&self) -> Vec<Arc<Tenant>> {
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<_> = tenants
            .values()
            .filter(|tenant| !tenant.is_public() && tenant.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.schema.cmp(&b.schema));
        active
    }

    pub fn bind(&self, tenant: Arc<Tenant>) -> TenantScope {
        TenantScope::acquire(tenant, self.active_bindings.clone())
    }

    pub fn bind_id(&self, id: TenantId) -> Result<TenantScope, TenancyError> {
        Ok(self.bind(self.tenant_by_id(id)?))
    }

    /// Runs `work` with the tenant bound. The binding is released on every
    /// exit path, including cancellation of the returned future.
    pub async fn with_tenant<F, Fut, T>(&self, tenant: Arc<Tenant>, work: F) -> T
    where
        F: FnOnce(TenantContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let scope = self.bind(tenant);
        let result = work(scope.context().clone()).await;
        drop(scope);
        result
    }

    /// Number of bindings currently held.
    pub fn active_bindings(&self) -> usize {
        self.active_bindings.load(Ordering::Acquire)
    }

    /// Number of times the host index has been rebuilt.
    pub fn index_builds(&self) -> usize {
        self.index_builds.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        *self.host_index.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn host_index(&self) -> HostIndex {
        if let Some(index) = self
            .host_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return index.clone();
        }

        let mut slot = self.host_index.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = slot.as_ref() {
            return index.clone();
        }
        let tenants = self.tenants.read().unwrap_or_else(PoisonError::into_inner);
        let index: HostIndex = Arc::new(
            tenants
                .values()
                .map(|tenant| (tenant.domain.clone(), tenant.clone()))
                .collect(),
        );
        self.index_builds.fetch_add(1, Ordering::AcqRel);
        *slot = Some(index.clone());
        index
    }
}

impl TenantResolver for TenantDirectory {
    fn resolve_for_request(&self, host: &str, path: &str) -> Result<Arc<Tenant>, TenancyError> {
        if path == VERSIONS_PATH || path.starts_with("/versions/") {
            return self.public_tenant();
        }

        let tenant = self.resolve_tenant_by_host(host)?;
        if tenant.is_public() {
            return Err(TenancyError::PublicTenantNotRoutable);
        }
        if tenant.state == TenantState::Suspended {
            return Err(TenancyError::Inactive(tenant.id));
        }
        Ok(tenant)
    }

    fn tenant_by_id(&self, id: TenantId) -> Result<Arc<Tenant>, TenancyError> {
        self.tenants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(TenancyError::UnknownTenant(id))
    }

    fn bind(&self, tenant: Arc<Tenant>) -> TenantScope {
        TenantDirectory::bind(self, tenant)
    }
}

fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('.');
    let without_port = match trimmed.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => trimmed,
    };
    without_port.to_ascii_lowercase()
}
