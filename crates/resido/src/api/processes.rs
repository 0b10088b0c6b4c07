use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Extension;
use serde_json::json;

use super::envelope::{ok, ApiError, ApiResult};
use super::{authorize, ApiState};
use crate::auth::RequestContext;
use crate::features::{codes, Action};
use crate::ids::ProcessId;
use crate::process::ProcessFilter;

const PROCESS_ENTITY: &str = "process";

pub(crate) async fn list(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    filter: Result<Query<ProcessFilter>, QueryRejection>,
) -> ApiResult {
    let tenant = authorize(&state, &ctx, codes::PROCESSES, Action::View)?;
    let Query(filter) = filter.map_err(ApiError::invalid_request)?;

    let page = state.registry.list(&ctx, &filter)?;
    let mut body = serde_json::to_value(&page).map_err(ApiError::internal)?;
    if let Some(items) = body.get_mut("items") {
        state
            .permissions
            .mask(tenant, &ctx.principal, PROCESS_ENTITY, items)?;
    }
    Ok(ok(body))
}

pub(crate) async fn detail(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    process_id: Result<Path<ProcessId>, PathRejection>,
) -> ApiResult {
    let tenant = authorize(&state, &ctx, codes::PROCESSES, Action::View)?;
    let Path(process_id) = process_id.map_err(ApiError::invalid_request)?;

    let view = state.registry.detail(&ctx, process_id)?;
    let mut body = serde_json::to_value(&view).map_err(ApiError::internal)?;
    state
        .permissions
        .mask(tenant, &ctx.principal, PROCESS_ENTITY, &mut body)?;
    Ok(ok(body))
}

/// Runs the stale-process sweep synchronously and reports how many
/// processes it failed.
pub(crate) async fn terminate(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult {
    let tenant = authorize(&state, &ctx, codes::PROCESSES, Action::Update)?;
    let count = state.registry.sweep_stale(tenant, state.stale_threshold)?;
    tracing::info!(
        tenant = %tenant.schema(),
        request_id = %ctx.request_id,
        count,
        "stale processes terminated on request"
    );
    Ok(ok(json!({ "count": count })))
}
