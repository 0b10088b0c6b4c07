use metrics_exporter_prometheus::PrometheusHandle;
use resido::tenancy::{NewTenant, TenantState, TenancyError};
use resido::Engine;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// A tenant named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TenantSeed {
    pub(crate) schema: String,
    pub(crate) domain: String,
}

pub(crate) fn parse_tenant_seed(raw: &str) -> Result<TenantSeed, String> {
    let (schema, domain) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected schema=domain, got '{raw}'"))?;
    let (schema, domain) = (schema.trim(), domain.trim());
    if schema.is_empty() || domain.is_empty() {
        return Err(format!("schema and domain must both be set in '{raw}'"));
    }
    Ok(TenantSeed {
        schema: schema.to_string(),
        domain: domain.to_string(),
    })
}

pub(crate) fn provision_seeds(engine: &Engine, seeds: &[TenantSeed]) -> Result<(), TenancyError> {
    for seed in seeds {
        let tenant = engine.provision_tenant(NewTenant {
            schema: seed.schema.clone(),
            domain: seed.domain.clone(),
            name: seed.schema.clone(),
            state: TenantState::Active,
        })?;
        tracing::info!(tenant = %tenant.schema, domain = %tenant.domain, "tenant seeded");
    }
    Ok(())
}
