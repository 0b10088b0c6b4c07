//! HTTP surface of the engine.
//!
//! Every route runs behind [`attach_request_context`], so handlers receive a
//! tenant-bound [`RequestContext`] as a request extension. Responses use the
//! standard envelope: `{"status": true, "data": ...}` on success and
//! `{"status": false, "errors": [...]}` on failure.

mod envelope;
mod login;
mod processes;
mod recon;
mod refunds;
mod versions;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Duration, Utc};

use crate::auth::{attach_request_context, Authenticator, ContextState, RequestContext};
use crate::clock::SharedClock;
use crate::dispatch::TaskDispatcher;
use crate::features::{Action, FeatureGate, PermissionCatalog};
use crate::payments::RefundRequestService;
use crate::process::ProcessRegistry;
use crate::tenancy::{TenantContext, VERSIONS_PATH};

pub use envelope::{ok, ApiError, ApiResult};

/// Shared handles every handler may reach.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ProcessRegistry>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub refunds: Arc<RefundRequestService>,
    pub authenticator: Arc<Authenticator>,
    pub features: Arc<FeatureGate>,
    pub permissions: Arc<PermissionCatalog>,
    /// Running processes older than this are failed by the terminate route.
    pub stale_threshold: Duration,
    pub clock: SharedClock,
    pub started_at: DateTime<Utc>,
}

/// Builds the `/api/v1` and `/versions` routes with the request-context
/// middleware applied.
pub fn router(state: ApiState, context: ContextState) -> Router {
    Router::new()
        .route("/api/v1/processes", get(processes::list))
        .route("/api/v1/processes/terminate", post(processes::terminate))
        .route("/api/v1/processes/:process_id", get(processes::detail))
        .route(
            "/api/v1/bills/:bill_id/refund-requests",
            post(refunds::create),
        )
        .route(
            "/api/v1/bill-refund-requests/:refund_request_id",
            get(refunds::detail),
        )
        .route("/api/v1/txn-recon/trigger", post(recon::trigger))
        .route("/api/v1/auth/login", post(login::login))
        .route(VERSIONS_PATH, get(versions::versions))
        .with_state(state)
        .layer(middleware::from_fn_with_state(context, attach_request_context))
}

/// Operator routes: a staff-grade principal, the module switched on in the
/// tenant's plan, and a role grant for `action`.
pub(crate) fn authorize<'a>(
    state: &ApiState,
    ctx: &'a RequestContext,
    module: &str,
    action: Action,
) -> Result<&'a TenantContext, ApiError> {
    ctx.require_operator()?;
    let tenant = ctx.tenant()?;
    if !state.features.feature_active(tenant.tenant_id(), module) {
        return Err(ApiError::feature_disabled(module));
    }
    state
        .permissions
        .check(tenant, &ctx.principal, module, action)?;
    Ok(tenant)
}
