use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::{Extension, Json};

use super::envelope::{accepted, ok, ApiError, ApiResult};
use super::{authorize, ApiState};
use crate::auth::RequestContext;
use crate::features::{codes, Action};
use crate::ids::{BillId, RefundRequestId};
use crate::payments::NewRefundRequest;

/// Accepts a refund request for a bill. The refund itself runs on the
/// worker pool; the response carries the process to poll.
pub(crate) async fn create(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    bill_id: Result<Path<BillId>, PathRejection>,
    payload: Result<Json<NewRefundRequest>, JsonRejection>,
) -> ApiResult {
    authorize(&state, &ctx, codes::PAYMENTS, Action::Create)?;
    let Path(bill_id) = bill_id.map_err(ApiError::invalid_request)?;
    let Json(request) = payload.map_err(ApiError::invalid_request)?;

    let submission = state.refunds.create(&ctx, bill_id, request).await?;
    Ok(accepted(submission))
}

pub(crate) async fn detail(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
    refund_request_id: Result<Path<RefundRequestId>, PathRejection>,
) -> ApiResult {
    authorize(&state, &ctx, codes::PAYMENTS, Action::View)?;
    let Path(id) = refund_request_id.map_err(ApiError::invalid_request)?;
    Ok(ok(state.refunds.get(&ctx, id)?))
}
