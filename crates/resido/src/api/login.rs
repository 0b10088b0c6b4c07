use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;

use super::envelope::{ok, ApiError, ApiResult};
use super::ApiState;
use crate::auth::RequestContext;

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    email: String,
    password: String,
}

/// Issues a full-access token bound to the tenant the request was routed to.
pub(crate) async fn login(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = payload.map_err(ApiError::invalid_request)?;
    let tenant = ctx.tenant()?;
    let token = state
        .authenticator
        .login(tenant, &request.email, &request.password)?;
    tracing::info!(tenant = %tenant.schema(), request_id = %ctx.request_id, "token issued");
    Ok(ok(token))
}
