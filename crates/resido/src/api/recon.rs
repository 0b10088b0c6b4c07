use axum::extract::State;
use axum::Extension;
use serde_json::json;

use super::envelope::{accepted, ApiResult};
use super::{authorize, ApiState};
use crate::auth::RequestContext;
use crate::features::{codes, Action};
use crate::process::{NewProcess, ProcessType};

/// Object id shared by every adhoc reconciliation, so at most one is in
/// flight per tenant.
const RECON_OBJECT_ID: &str = "txn-recon";

pub(crate) async fn trigger(
    State(state): State<ApiState>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult {
    let tenant = authorize(&state, &ctx, codes::PAYMENTS, Action::Create)?;
    let process = state
        .dispatcher
        .submit(
            tenant,
            NewProcess::adhoc(ProcessType::TransactionsReconciliation, ctx.request_id)
                .for_object(RECON_OBJECT_ID, "Transactions reconciliation")
                .created_by(ctx.actor()),
        )
        .await?;
    Ok(accepted(json!({
        "process_id": process.id,
        "task_id": process.task_id,
    })))
}
