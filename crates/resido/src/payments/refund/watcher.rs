use std::sync::Arc;

use serde_json::{json, Value};

use crate::events::{DomainEvent, EventError, EventSubscriber};
use crate::ids::RefundRequestId;
use crate::process::{ProcessStatus, ProcessType};
use crate::tenancy::TenantContext;

use super::orchestrator::RefundOrchestrator;

/// Fails the refund request behind a `PROCESS_BILL_REFUND_REQUEST` process
/// that ended without settling it, such as one terminated by the stale
/// sweep or canceled by an operator.
pub struct RefundProcessWatcher {
    refunds: Arc<RefundOrchestrator>,
}

impl RefundProcessWatcher {
    pub fn new(refunds: Arc<RefundOrchestrator>) -> Self {
        Self { refunds }
    }
}

/// A completed process may still leave rows waiting on reconciliation; any
/// other terminal status means nothing will run the request again.
pub(crate) fn ended_unsettled(status: ProcessStatus) -> bool {
    status.is_terminal() && status != ProcessStatus::Completed
}

pub(crate) fn process_ended_body(status: ProcessStatus) -> Value {
    json!({
        "status": false,
        "errors": [{
            "code": "refund_process_ended",
            "message": format!("the refund process ended {status} before this line ran"),
        }],
    })
}

fn fail(message: impl ToString) -> EventError {
    EventError {
        subscriber: "refund_process_watcher",
        message: message.to_string(),
    }
}

impl EventSubscriber for RefundProcessWatcher {
    fn name(&self) -> &'static str {
        "refund_process_watcher"
    }

    fn handle(&self, ctx: &TenantContext, event: &DomainEvent) -> Result<(), EventError> {
        let DomainEvent::ProcessTransitioned {
            process_type: ProcessType::ProcessBillRefundRequest,
            object_id: Some(object_id),
            to,
            ..
        } = event
        else {
            return Ok(());
        };
        if !ended_unsettled(*to) {
            return Ok(());
        }

        let id: RefundRequestId = object_id
            .parse()
            .map_err(|_| fail(format!("{object_id} is not a refund request id")))?;
        let report = self
            .refunds
            .abandon(ctx, id, process_ended_body(*to))
            .map_err(fail)?;
        tracing::info!(
            tenant = %ctx.schema(),
            refund_request_id = %id,
            process_status = %to,
            status = ?report.status,
            "refund request closed after its process ended"
        );
        Ok(())
    }
}
