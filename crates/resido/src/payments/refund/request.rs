use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::dispatch::TaskDispatcher;
use crate::ids::{BillId, ProcessId, RefundRequestId, TransactionId};
use crate::process::{NewProcess, ProcessType};
use crate::tenancy::TenantContext;

use crate::payments::domain::{
    Bill, BillRefundRequest, RefundRequestStatus, RefundType, Transaction, TransactionKind,
    TransactionMethod, TransactionStatus,
};
use crate::payments::error::PaymentError;
use crate::payments::repository::PaymentRepository;
use crate::payments::service::{display_id, error_body};

use super::orchestrator::RefundOrchestrator;
use super::watcher::{ended_unsettled, process_ended_body};

#[derive(Debug, Clone, Deserialize)]
pub struct NewRefundLine {
    pub parent: TransactionId,
    pub amount: i64,
    pub method: TransactionMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRefundRequest {
    pub refund_type: RefundType,
    pub lines: Vec<NewRefundLine>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundSubmission {
    pub refund_request: BillRefundRequest,
    pub process_id: ProcessId,
    pub task_id: Option<uuid::Uuid>,
}

/// A refund request with its refund rows and their error bodies.
#[derive(Debug, Clone, Serialize)]
pub struct RefundRequestDetail {
    pub refund_request: BillRefundRequest,
    pub refunds: Vec<Transaction>,
}

/// Accepts refund requests. Lines are validated against the bill and their
/// parent payments, recorded as Pending refund rows, and handed to the
/// dispatcher as one `PROCESS_BILL_REFUND_REQUEST` process.
pub struct RefundRequestService {
    repository: Arc<dyn PaymentRepository>,
    dispatcher: Arc<TaskDispatcher>,
    refunds: Arc<RefundOrchestrator>,
    clock: SharedClock,
}

impl RefundRequestService {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        dispatcher: Arc<TaskDispatcher>,
        refunds: Arc<RefundOrchestrator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            refunds,
            clock,
        }
    }

    pub async fn create(
        &self,
        ctx: &RequestContext,
        bill_id: BillId,
        request: NewRefundRequest,
    ) -> Result<RefundSubmission, PaymentError> {
        let tenant = ctx.tenant()?;
        let bill = self
            .repository
            .bill(tenant, bill_id)?
            .filter(|bill| ctx.row_filter().permits(bill))
            .ok_or(PaymentError::BillNotFound(bill_id))?;

        if self.in_progress(tenant, &bill)? {
            return Err(PaymentError::RefundInProgress(bill.id));
        }

        let total = self.validate(tenant, &bill, &request)?;

        let now = self.clock.now();
        let id = RefundRequestId::new();
        let display = display_id("BRR", id.as_uuid());
        let process = self.dispatcher.registry().create(
            tenant,
            NewProcess::adhoc(ProcessType::ProcessBillRefundRequest, ctx.request_id)
                .for_object(id.to_string(), display.clone())
                .with_payload(json!({
                    "bill_id": bill.id,
                    "refund_request_id": id,
                }))
                .created_by(ctx.actor()),
        )?;

        let refund_request = self.repository.insert_refund_request(
            tenant,
            BillRefundRequest {
                id,
                display_id: display,
                bill_id: bill.id,
                resident_id: bill.resident_id,
                location: bill.location.clone(),
                refund_type: request.refund_type,
                total_amount_requested: total,
                total_refund_processed: 0,
                currency: bill.currency.clone(),
                status: RefundRequestStatus::Pending,
                process_id: Some(process.id),
                reason: request.reason,
                created_by: Some(ctx.actor()),
                created_at: now,
                updated_at: now,
                version: 0,
            },
        )?;

        let mut rows = Vec::with_capacity(request.lines.len());
        for (sequence, line) in request.lines.iter().enumerate() {
            let refund = Transaction {
                id: TransactionId::new(),
                bill_id: bill.id,
                resident_id: bill.resident_id,
                location: bill.location.clone(),
                kind: TransactionKind::Refund,
                method: line.method,
                amount: line.amount,
                currency: bill.currency.clone(),
                refunded_amount: 0,
                parent: Some(line.parent),
                refund_request: Some(id),
                sequence: sequence as u32,
                status: TransactionStatus::Pending,
                gateway_status: None,
                gateway_txn_id: None,
                idempotency_key: format!("{id}:{sequence}"),
                methodology: None,
                error_body: None,
                gateway_response: None,
                last_recon_request_id: None,
                last_recon_at: None,
                created_by: Some(ctx.actor()),
                created_at: now,
                updated_at: now,
                version: 0,
            };
            rows.push(self.repository.insert_transaction(tenant, refund)?);
        }

        let process = match self.dispatcher.enqueue(tenant, process).await {
            Ok(process) => process,
            Err(err) => {
                if let Err(abandon_err) = self.refunds.abandon(tenant, refund_request.id, error_body(&err)) {
                    tracing::warn!(
                        refund_request_id = %refund_request.id,
                        error = %abandon_err,
                        "could not fail unenqueued refund request"
                    );
                }
                return Err(err.into());
            }
        };

        tracing::info!(
            tenant = %tenant.schema(),
            bill_id = %bill.id,
            refund_request_id = %refund_request.id,
            process_id = %process.id,
            request_id = %ctx.request_id,
            lines = rows.len(),
            total,
            "refund request accepted"
        );
        Ok(RefundSubmission {
            refund_request,
            process_id: process.id,
            task_id: process.task_id,
        })
    }

    pub fn get(&self, ctx: &RequestContext, id: RefundRequestId) -> Result<RefundRequestDetail, PaymentError> {
        let tenant = ctx.tenant()?;
        let refund_request = self
            .repository
            .refund_request(tenant, id)?
            .filter(|request| ctx.row_filter().permits(request))
            .ok_or(PaymentError::RefundRequestNotFound(id))?;
        let refunds = self.repository.refunds_for_request(tenant, id)?;
        Ok(RefundRequestDetail {
            refund_request,
            refunds,
        })
    }

    /// Whether a Pending request still blocks the bill. A Pending request
    /// whose process already ended unsettled is failed on the way.
    fn in_progress(&self, tenant: &TenantContext, bill: &Bill) -> Result<bool, PaymentError> {
        for existing in self.repository.refund_requests_for_bill(tenant, bill.id)? {
            if existing.status != RefundRequestStatus::Pending {
                continue;
            }
            let ended = match existing.process_id {
                Some(process_id) => {
                    let process = self.dispatcher.registry().get(tenant, process_id)?;
                    Some(process.status).filter(|status| ended_unsettled(*status))
                }
                None => None,
            };
            let Some(status) = ended else {
                return Ok(true);
            };
            let report = self.refunds.abandon(tenant, existing.id, process_ended_body(status))?;
            if report.status == RefundRequestStatus::Pending {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns the requested total.
    fn validate(&self, tenant: &TenantContext, bill: &Bill, request: &NewRefundRequest) -> Result<i64, PaymentError> {
        if request.lines.is_empty() {
            return Err(PaymentError::EmptyRefund);
        }

        let transactions = self.repository.transactions_for_bill(tenant, bill.id)?;
        let by_id: HashMap<TransactionId, &Transaction> =
            transactions.iter().map(|txn| (txn.id, txn)).collect();

        let mut requested_per_parent: HashMap<TransactionId, i64> = HashMap::new();
        for line in &request.lines {
            if line.amount <= 0 {
                return Err(PaymentError::InvalidAmount);
            }
            if !line.method.is_refund_method() {
                return Err(PaymentError::UnsupportedRefundMethod(line.method));
            }
            let parent = by_id.get(&line.parent).ok_or(PaymentError::InvalidParent {
                parent: line.parent,
                reason: "not a payment on this bill",
            })?;
            if parent.kind != TransactionKind::Payment {
                return Err(PaymentError::InvalidParent {
                    parent: parent.id,
                    reason: "refunds can only target payments",
                });
            }
            if !parent.status.is_captured() {
                return Err(PaymentError::InvalidParent {
                    parent: parent.id,
                    reason: "payment was not captured",
                });
            }
            *requested_per_parent.entry(parent.id).or_default() += line.amount;
        }

        for (parent_id, requested) in &requested_per_parent {
            let parent = by_id[parent_id];
            let in_flight: i64 = transactions
                .iter()
                .filter(|txn| {
                    txn.kind == TransactionKind::Refund
                        && txn.parent == Some(*parent_id)
                        && txn.status == TransactionStatus::Pending
                })
                .map(|txn| txn.amount)
                .sum();
            let available = (parent.remaining() - in_flight).max(0);
            if *requested > available {
                return Err(PaymentError::ExceedsParent {
                    parent: *parent_id,
                    requested: *requested,
                    available,
                });
            }
        }

        let total: i64 = request.lines.iter().map(|line| line.amount).sum();
        if total > bill.refundable_amount {
            return Err(PaymentError::ExceedsRefundable {
                requested: total,
                refundable: bill.refundable_amount,
            });
        }
        if request.refund_type == RefundType::Full && total != bill.refundable_amount {
            return Err(PaymentError::FullRefundMismatch {
                requested: total,
                refundable: bill.refundable_amount,
            });
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::clock::ManualClock;
    use crate::config::DispatcherConfig;
    use crate::dispatch::InMemoryBroker;
    use crate::events::EventBus;
    use crate::ids::RequestId;
    use crate::payments::gateway::{GatewayRouter, SimulatedGateway};
    use crate::payments::repository::InMemoryPaymentRepository;
    use crate::payments::service::{NewBill, NewPayment, PaymentService};
    use crate::process::{InMemoryProcessRepository, ProcessRegistry, ProcessStatus, ProcessUpdate};
    use crate::tenancy::{NewTenant, TenantDirectory, TenantState};

    /// Refund requests without the process watcher subscribed, as if the
    /// ending of a process had gone unobserved.
    struct Fixture {
        payments: PaymentService,
        requests: RefundRequestService,
        registry: Arc<ProcessRegistry>,
        broker: Arc<InMemoryBroker>,
        ctx: RequestContext,
    }

    fn fixture() -> Fixture {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let directory = TenantDirectory::new("admin.resido.test", clock.clone());
        let tenant = directory
            .provision(NewTenant {
                schema: "cedar".into(),
                domain: "cedar.resido.test".into(),
                name: "Cedar".into(),
                state: TenantState::Active,
            })
            .expect("tenant provisions");
        let tenant_ctx = directory.bind(tenant).context().clone();

        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ProcessRegistry::new(
            Arc::new(InMemoryProcessRepository::new()),
            events.clone(),
            clock.clone(),
        ));
        let broker = Arc::new(InMemoryBroker::new(clock.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(registry.clone(), broker.clone(), &DispatcherConfig::default()));
        let repository: Arc<dyn PaymentRepository> = Arc::new(InMemoryPaymentRepository::new());
        let gateways = GatewayRouter::new(Arc::new(SimulatedGateway::new()));
        let refunds = Arc::new(RefundOrchestrator::new(repository.clone(), gateways.clone(), events, clock.clone()));
        Fixture {
            payments: PaymentService::new(repository.clone(), gateways, clock.clone()),
            requests: RefundRequestService::new(repository, dispatcher, refunds, clock),
            registry,
            broker,
            ctx: RequestContext::new(tenant_ctx, Principal::system(), RequestId::new()),
        }
    }

    fn paid_bill(fx: &Fixture, amount: i64) -> (Bill, Transaction) {
        let bill = fx
            .payments
            .create_bill(
                &fx.ctx,
                NewBill {
                    resident_id: crate::ids::ResidentId::new(),
                    location: Default::default(),
                    amount,
                    currency: "USD".to_string(),
                    display_id: None,
                },
            )
            .expect("bill");
        let payment = fx
            .payments
            .record_payment(
                &fx.ctx,
                bill.id,
                NewPayment {
                    method: TransactionMethod::Cash,
                    amount,
                    currency: "USD".to_string(),
                    gateway_txn_id: None,
                    gateway_status: None,
                    status: TransactionStatus::Completed,
                    idempotency_key: None,
                },
            )
            .expect("payment");
        (bill, payment)
    }

    fn cash_refund(parent: &Transaction, amount: i64) -> NewRefundRequest {
        NewRefundRequest {
            refund_type: RefundType::Partial,
            lines: vec![NewRefundLine {
                parent: parent.id,
                amount,
                method: TransactionMethod::Cash,
            }],
            reason: None,
        }
    }

    #[tokio::test]
    async fn requests_whose_process_ended_no_longer_block_the_bill() {
        let fx = fixture();
        let (bill, payment) = paid_bill(&fx, 1_000);
        let first = fx.requests.create(&fx.ctx, bill.id, cash_refund(&payment, 100)).await.expect("first");

        let tenant = fx.ctx.tenant().expect("tenant");
        fx.registry
            .transition(tenant, first.process_id, ProcessStatus::Running, ProcessUpdate::default())
            .expect("running");
        let err = fx
            .requests
            .create(&fx.ctx, bill.id, cash_refund(&payment, 100))
            .await
            .expect_err("still running");
        assert!(matches!(err, PaymentError::RefundInProgress(_)));

        fx.registry
            .transition(tenant, first.process_id, ProcessStatus::Failed, ProcessUpdate::default())
            .expect("failed");
        fx.requests
            .create(&fx.ctx, bill.id, cash_refund(&payment, 100))
            .await
            .expect("accepted once the first process ended");

        let detail = fx.requests.get(&fx.ctx, first.refund_request.id).expect("detail");
        assert_eq!(detail.refund_request.status, RefundRequestStatus::Failed);
        assert_eq!(detail.refunds[0].status, TransactionStatus::RefundFailed);
        let body = detail.refunds[0].error_body.as_ref().expect("error body");
        assert_eq!(body["errors"][0]["code"], "refund_process_ended");
    }

    #[tokio::test]
    async fn unenqueued_requests_are_failed_with_their_rows() {
        let fx = fixture();
        let (bill, payment) = paid_bill(&fx, 500);
        fx.broker.set_available(false);

        let err = fx
            .requests
            .create(&fx.ctx, bill.id, cash_refund(&payment, 200))
            .await
            .expect_err("broker offline");
        assert!(matches!(err, PaymentError::Dispatch(_)));

        fx.broker.set_available(true);
        let retry = fx
            .requests
            .create(&fx.ctx, bill.id, cash_refund(&payment, 200))
            .await
            .expect("the failed attempt does not block the bill");
        assert_eq!(retry.refund_request.status, RefundRequestStatus::Pending);
    }
}
