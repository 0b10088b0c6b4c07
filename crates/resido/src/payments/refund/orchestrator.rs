use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::dispatch::{AsyncProcessor, ProcessorError, RunOutcome};
use crate::events::{DomainEvent, EventBus};
use crate::ids::{RefundRequestId, TransactionId};
use crate::process::{Process, ProcessType};
use crate::tenancy::TenantContext;

use crate::payments::domain::{
    Bill, BillRefundRequest, BillStatus, LedgerEntry, LedgerKind, RefundMethodology,
    RefundRequestStatus, RefundType, Transaction, TransactionEvent, TransactionKind,
    TransactionMethod, TransactionStatus,
};
use crate::payments::error::PaymentError;
use crate::payments::gateway::{
    GatewayCharge, GatewayRouter, RefundCall, RefundDisposition, RefundResult,
};
use crate::payments::repository::PaymentRepository;
use crate::payments::service::{error_body, log_event, settle_bill};

const CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundReport {
    pub refund_request_id: RefundRequestId,
    pub status: RefundRequestStatus,
    pub success_count: usize,
    pub pending_count: usize,
    pub total_count: usize,
    pub total_refund_processed: i64,
    /// The request had already settled; nothing was executed.
    pub replayed: bool,
}

/// What happened to one refund row.
enum Step {
    /// Booked against the parent for this amount.
    Completed(i64),
    /// The outcome is unknown; reconciliation resolves it.
    Pending,
    Failed(Value),
}

fn failure(code: &str, message: impl Into<String>) -> Value {
    json!({
        "status": false,
        "errors": [{ "code": code, "message": message.into() }],
    })
}

/// Executes the refund rows of a [`BillRefundRequest`] in creation order and
/// drives the request and bill statuses from the outcome. Each row is
/// committed before the next one starts, so a crash never leaves a bill
/// without a recorded outcome for the rows already attempted.
pub struct RefundOrchestrator {
    repository: Arc<dyn PaymentRepository>,
    gateways: GatewayRouter,
    events: Arc<EventBus>,
    clock: SharedClock,
}

impl RefundOrchestrator {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        gateways: GatewayRouter,
        events: Arc<EventBus>,
        clock: SharedClock,
    ) -> Self {
        Self {
            repository,
            gateways,
            events,
            clock,
        }
    }

    pub async fn process(&self, ctx: &TenantContext, id: RefundRequestId) -> Result<RefundReport, PaymentError> {
        let request = self
            .repository
            .refund_request(ctx, id)?
            .ok_or(PaymentError::RefundRequestNotFound(id))?;
        let refunds = self.repository.refunds_for_request(ctx, id)?;

        if request.status != RefundRequestStatus::Pending {
            tracing::info!(
                tenant = %ctx.schema(),
                refund_request_id = %id,
                status = ?request.status,
                "refund request already settled"
            );
            let mut report = tally(&request, &refunds);
            report.replayed = true;
            return Ok(report);
        }

        let initiated = initiated_status(request.refund_type);
        settle_bill(self.repository.as_ref(), ctx, request.bill_id, self.clock.now(), |_| {
            Some(initiated)
        })?;

        let mut seen_parents = HashSet::new();
        for refund in refunds {
            if refund.status != TransactionStatus::Pending || refund.gateway_response.is_some() {
                continue;
            }
            let refund_id = refund.id;
            let step = self.execute(ctx, &refund, &mut seen_parents).await;
            self.record(ctx, refund, step).map_err(|err| {
                tracing::error!(
                    tenant = %ctx.schema(),
                    transaction_id = %refund_id,
                    error = %err,
                    "failed to record refund outcome"
                );
                err
            })?;
        }

        self.conclude(ctx, id)
    }

    /// Fails a Pending request whose process ended without settling it. Rows
    /// that never reached the gateway are failed with `body`; rows waiting on
    /// a gateway outcome stay for reconciliation.
    pub fn abandon(&self, ctx: &TenantContext, id: RefundRequestId, body: Value) -> Result<RefundReport, PaymentError> {
        let request = self
            .repository
            .refund_request(ctx, id)?
            .ok_or(PaymentError::RefundRequestNotFound(id))?;
        if request.status != RefundRequestStatus::Pending {
            let refunds = self.repository.refunds_for_request(ctx, id)?;
            return Ok(tally(&request, &refunds));
        }

        let now = self.clock.now();
        let mut failed = 0;
        for mut refund in self.repository.refunds_for_request(ctx, id)? {
            if refund.status != TransactionStatus::Pending || refund.gateway_response.is_some() {
                continue;
            }
            refund.status = TransactionStatus::RefundFailed;
            refund.error_body = Some(body.clone());
            refund.updated_at = now;
            self.repository.update_transaction(ctx, refund)?;
            failed += 1;
        }
        tracing::warn!(
            tenant = %ctx.schema(),
            refund_request_id = %id,
            failed,
            "refund request abandoned"
        );
        self.conclude(ctx, id)
    }

    /// Settles a Pending request whose rows have all reached an outcome.
    /// Requests with rows still Pending are left untouched.
    pub fn conclude(&self, ctx: &TenantContext, id: RefundRequestId) -> Result<RefundReport, PaymentError> {
        for _ in 0..CONFLICT_RETRIES {
            let mut request = self
                .repository
                .refund_request(ctx, id)?
                .ok_or(PaymentError::RefundRequestNotFound(id))?;
            let refunds = self.repository.refunds_for_request(ctx, id)?;
            let report = tally(&request, &refunds);
            if request.status != RefundRequestStatus::Pending || report.pending_count > 0 {
                return Ok(report);
            }

            let now = self.clock.now();
            request.status = report.status;
            request.total_refund_processed = report.total_refund_processed;
            request.updated_at = now;
            let request = match self.repository.update_refund_request(ctx, request) {
                Err(PaymentError::VersionConflict { .. }) => continue,
                other => other?,
            };

            let target = settled_status(request.refund_type, request.status);
            let bill = settle_bill(self.repository.as_ref(), ctx, request.bill_id, now, |bill| {
                Some(force_refunded(bill, target))
            })?;

            tracing::info!(
                tenant = %ctx.schema(),
                refund_request_id = %request.id,
                bill_id = %bill.id,
                status = ?request.status,
                bill_status = ?bill.status,
                success_count = report.success_count,
                total_count = report.total_count,
                "refund request settled"
            );
            self.events.publish(
                ctx,
                DomainEvent::RefundRequestSettled {
                    refund_request_id: request.id,
                    bill_id: request.bill_id,
                    resident_id: request.resident_id,
                    status: request.status,
                    total_refund_processed: request.total_refund_processed,
                    currency: request.currency.clone(),
                },
            );
            return Ok(report);
        }
        Err(PaymentError::VersionConflict {
            entity: "refund_request",
            id: id.to_string(),
        })
    }

    async fn execute(&self, ctx: &TenantContext, refund: &Transaction, seen: &mut HashSet<TransactionId>) -> (Step, Option<RefundResult>) {
        let Some(parent_id) = refund.parent else {
            let err = PaymentError::MissingParent(refund.id);
            tracing::error!(transaction_id = %refund.id, "refund row without parent payment");
            return (Step::Failed(error_body(&err)), None);
        };
        if !seen.insert(parent_id) {
            return (
                Step::Failed(failure(
                    "duplicate_refund_attempt",
                    format!("transaction {parent_id} is already refunded by this request"),
                )),
                None,
            );
        }

        match self.apply(ctx, refund, parent_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    tenant = %ctx.schema(),
                    transaction_id = %refund.id,
                    error = %err,
                    "refund line failed"
                );
                (Step::Failed(error_body(&err)), None)
            }
        }
    }

    async fn apply(
        &self,
        ctx: &TenantContext,
        refund: &Transaction,
        parent_id: TransactionId,
    ) -> Result<(Step, Option<RefundResult>), PaymentError> {
        let parent = self
            .repository
            .transaction(ctx, parent_id)?
            .ok_or(PaymentError::TransactionNotFound(parent_id))?;
        let available = (parent.amount - self.refunded_elsewhere(ctx, &parent, refund.id)?).max(0);
        if refund.amount > available {
            let err = PaymentError::ExceedsParent {
                parent: parent.id,
                requested: refund.amount,
                available,
            };
            return Ok((Step::Failed(error_body(&err)), None));
        }
        let now = self.clock.now();

        match refund.method {
            TransactionMethod::Cash => {
                let booked = self.propagate(ctx, refund, Some(RefundMethodology::Cash))?;
                Ok((Step::Completed(booked), None))
            }
            TransactionMethod::WriteOff | TransactionMethod::Adjustment => {
                let kind = if refund.method == TransactionMethod::WriteOff {
                    LedgerKind::WriteOff
                } else {
                    LedgerKind::Adjustment
                };
                self.repository.append_ledger(
                    ctx,
                    LedgerEntry {
                        id: Uuid::new_v4(),
                        kind,
                        bill_id: refund.bill_id,
                        transaction_id: refund.id,
                        amount: refund.amount,
                        currency: refund.currency.clone(),
                        recorded_at: now,
                    },
                )?;
                let booked = self.propagate(ctx, refund, None)?;
                Ok((Step::Completed(booked), None))
            }
            TransactionMethod::Wallet => {
                let wallet = self.repository.credit_wallet(
                    ctx,
                    refund.resident_id,
                    refund.id,
                    refund.amount,
                    &refund.currency,
                    now,
                )?;
                tracing::debug!(resident_id = %wallet.resident_id, balance = wallet.balance, "wallet credited");
                let booked = self.propagate(ctx, refund, None)?;
                Ok((Step::Completed(booked), None))
            }
            TransactionMethod::BackToSource => self.back_to_source(ctx, refund, &parent, now).await,
            other => Err(PaymentError::UnsupportedRefundMethod(other)),
        }
    }

    async fn back_to_source(
        &self,
        ctx: &TenantContext,
        refund: &Transaction,
        parent: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<(Step, Option<RefundResult>), PaymentError> {
        let Some(parent_gateway_txn_id) = parent.gateway_txn_id.clone() else {
            return Ok((
                Step::Failed(failure(
                    "parent_not_refundable_to_source",
                    format!("transaction {} has no gateway reference", parent.id),
                )),
                None,
            ));
        };
        let call = RefundCall {
            parent_gateway_txn_id,
            parent_method: parent.method,
            charge: GatewayCharge {
                idempotency_key: refund.idempotency_key.clone(),
                amount: refund.amount,
                currency: refund.currency.clone(),
            },
        };
        let gateway = self.gateways.for_method(parent.method);
        let result = gateway.refund(&call).await?;

        let event = match result.methodology {
            Some(RefundMethodology::Void) => TransactionEvent::VoidGateway,
            Some(RefundMethodology::Credit) => TransactionEvent::CreditGateway,
            _ => TransactionEvent::QueryGateway,
        };
        log_event(
            self.repository.as_ref(),
            ctx,
            refund.id,
            event,
            json!({
                "gateway": gateway.name(),
                "parent_gateway_txn_id": call.parent_gateway_txn_id,
                "amount": refund.amount,
                "response": result.response,
            }),
            now,
        )?;

        let step = match result.disposition {
            RefundDisposition::Approved => Step::Completed(self.propagate(ctx, refund, result.methodology)?),
            RefundDisposition::Declined => Step::Failed(json!({
                "status": false,
                "errors": [{ "code": "refund_declined", "message": "the gateway declined the refund" }],
                "gateway_response": result.response,
            })),
            RefundDisposition::Pending => Step::Pending,
        };
        Ok((step, Some(result)))
    }

    /// Books a refund against its parent payment and returns the amount
    /// booked. The parent's refunded amount is rebuilt from its other
    /// completed refunds, so booking the same row twice changes nothing. A
    /// void cancels the whole authorization and books everything the parent
    /// has left.
    pub(crate) fn propagate(
        &self,
        ctx: &TenantContext,
        refund: &Transaction,
        methodology: Option<RefundMethodology>,
    ) -> Result<i64, PaymentError> {
        let parent_id = refund.parent.ok_or(PaymentError::MissingParent(refund.id))?;
        for _ in 0..CONFLICT_RETRIES {
            let mut parent = self
                .repository
                .transaction(ctx, parent_id)?
                .ok_or(PaymentError::TransactionNotFound(parent_id))?;
            let elsewhere = self.refunded_elsewhere(ctx, &parent, refund.id)?;
            let booked = if methodology == Some(RefundMethodology::Void) {
                (parent.amount - elsewhere).max(0)
            } else {
                refund.amount
            };
            parent.refunded_amount = (elsewhere + booked).min(parent.amount);
            parent.status = if parent.refunded_amount >= parent.amount {
                TransactionStatus::Refunded
            } else {
                TransactionStatus::PartiallyRefunded
            };
            if methodology.is_some() {
                parent.methodology = methodology;
            }
            parent.updated_at = self.clock.now();
            match self.repository.update_transaction(ctx, parent) {
                Err(PaymentError::VersionConflict { .. }) => continue,
                other => return other.map(|_| booked),
            }
        }
        Err(PaymentError::VersionConflict {
            entity: "transaction",
            id: parent_id.to_string(),
        })
    }

    /// What a void of `parent` books for `refund`: whatever the parent's
    /// other completed refunds left.
    pub(crate) fn void_amount(&self, ctx: &TenantContext, parent: &Transaction, refund: TransactionId) -> Result<i64, PaymentError> {
        Ok((parent.amount - self.refunded_elsewhere(ctx, parent, refund)?).max(0))
    }

    fn refunded_elsewhere(&self, ctx: &TenantContext, parent: &Transaction, refund: TransactionId) -> Result<i64, PaymentError> {
        Ok(self
            .repository
            .transactions_for_bill(ctx, parent.bill_id)?
            .iter()
            .filter(|txn| {
                txn.kind == TransactionKind::Refund
                    && txn.parent == Some(parent.id)
                    && txn.id != refund
                    && txn.status == TransactionStatus::Completed
            })
            .map(|txn| txn.amount)
            .sum())
    }

    fn record(&self, ctx: &TenantContext, mut refund: Transaction, (step, result): (Step, Option<RefundResult>)) -> Result<Transaction, PaymentError> {
        if let Some(result) = result {
            refund.methodology = result.methodology.or(refund.methodology);
            if result.gateway_txn_id.is_some() {
                refund.gateway_txn_id = result.gateway_txn_id;
            }
            refund.gateway_response = Some(result.response);
        }
        match step {
            Step::Completed(booked) => {
                if booked != refund.amount {
                    tracing::info!(
                        transaction_id = %refund.id,
                        requested = refund.amount,
                        booked,
                        "refund line rebooked at the voided amount"
                    );
                    refund.amount = booked;
                }
                refund.status = TransactionStatus::Completed;
                if refund.method == TransactionMethod::Cash {
                    refund.methodology = Some(RefundMethodology::Cash);
                }
            }
            Step::Pending => {}
            Step::Failed(body) => {
                refund.status = TransactionStatus::RefundFailed;
                refund.error_body = Some(body);
            }
        }
        refund.updated_at = self.clock.now();
        let refund = self.repository.update_transaction(ctx, refund)?;
        tracing::info!(
            tenant = %ctx.schema(),
            transaction_id = %refund.id,
            method = %refund.method,
            status = ?refund.status,
            "refund line recorded"
        );
        Ok(refund)
    }
}

fn tally(request: &BillRefundRequest, refunds: &[Transaction]) -> RefundReport {
    let success_count = refunds
        .iter()
        .filter(|refund| refund.status == TransactionStatus::Completed)
        .count();
    let pending_count = refunds
        .iter()
        .filter(|refund| refund.status == TransactionStatus::Pending)
        .count();
    let total_refund_processed = refunds
        .iter()
        .filter(|refund| refund.status == TransactionStatus::Completed)
        .map(|refund| refund.amount)
        .sum();
    let total_count = refunds.len();

    let status = if request.status != RefundRequestStatus::Pending || pending_count > 0 {
        request.status
    } else if success_count == 0 {
        RefundRequestStatus::Failed
    } else if success_count == total_count {
        RefundRequestStatus::Completed
    } else {
        RefundRequestStatus::PartialSuccess
    };

    RefundReport {
        refund_request_id: request.id,
        status,
        success_count,
        pending_count,
        total_count,
        total_refund_processed,
        replayed: false,
    }
}

fn initiated_status(refund_type: RefundType) -> BillStatus {
    match refund_type {
        RefundType::Full => BillStatus::RefundInitiated,
        RefundType::Partial => BillStatus::PartialRefundInitiated,
    }
}

fn settled_status(refund_type: RefundType, status: RefundRequestStatus) -> BillStatus {
    match (status, refund_type) {
        (RefundRequestStatus::Pending, kind) => initiated_status(kind),
        (RefundRequestStatus::Failed, RefundType::Full) => BillStatus::RefundFailed,
        (RefundRequestStatus::Failed, RefundType::Partial) => BillStatus::PartialRefundFailed,
        (RefundRequestStatus::Completed, RefundType::Full) => BillStatus::Refunded,
        (RefundRequestStatus::Completed, RefundType::Partial) => BillStatus::PartiallyRefunded,
        (RefundRequestStatus::PartialSuccess, _) => BillStatus::PartiallyRefunded,
    }
}

/// Nothing left to refund on a paid bill means it is refunded, whatever
/// the request outcome says.
fn force_refunded(bill: &Bill, target: BillStatus) -> BillStatus {
    if bill.refundable_amount == 0 && bill.paid_amount > 0 {
        BillStatus::Refunded
    } else {
        target
    }
}

/// Runs the orchestrator for `PROCESS_BILL_REFUND_REQUEST` processes.
pub struct BillRefundProcessor {
    orchestrator: Arc<RefundOrchestrator>,
}

impl BillRefundProcessor {
    pub fn new(orchestrator: Arc<RefundOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl AsyncProcessor for BillRefundProcessor {
    fn process_type(&self) -> ProcessType {
        ProcessType::ProcessBillRefundRequest
    }

    async fn run(&self, ctx: &RequestContext, _process: &Process, payload: &Value) -> Result<RunOutcome, ProcessorError> {
        let id: RefundRequestId = payload
            .get("refund_request_id")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcessorError::invalid_payload("refund_request_id is required"))?
            .parse()
            .map_err(|_| ProcessorError::invalid_payload("refund_request_id is not a valid id"))?;

        let report = self.orchestrator.process(ctx.tenant()?, id).await?;
        let body = RunOutcome::report_value(&report)?;
        if report.status == RefundRequestStatus::Failed {
            return Ok(RunOutcome::failed(
                "refund_failed",
                400,
                "no refund line of the request succeeded",
                Some(body),
            ));
        }
        Ok(RunOutcome::completed(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bill(paid: i64, refundable: i64) -> Bill {
        let now = Utc::now();
        Bill {
            id: crate::ids::BillId::new(),
            display_id: "BILL-1".to_string(),
            resident_id: crate::ids::ResidentId::new(),
            location: Default::default(),
            amount: paid,
            currency: "USD".to_string(),
            paid_amount: paid,
            refunded_amount: paid - refundable,
            refundable_amount: refundable,
            status: BillStatus::Completed,
            created_by: None,
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 0,
        }
    }

    #[test]
    fn bill_status_follows_the_request_outcome() {
        use RefundRequestStatus as R;
        assert_eq!(settled_status(RefundType::Full, R::Pending), BillStatus::RefundInitiated);
        assert_eq!(settled_status(RefundType::Partial, R::Pending), BillStatus::PartialRefundInitiated);
        assert_eq!(settled_status(RefundType::Full, R::Failed), BillStatus::RefundFailed);
        assert_eq!(settled_status(RefundType::Partial, R::Failed), BillStatus::PartialRefundFailed);
        assert_eq!(settled_status(RefundType::Full, R::Completed), BillStatus::Refunded);
        assert_eq!(settled_status(RefundType::Partial, R::Completed), BillStatus::PartiallyRefunded);
        assert_eq!(settled_status(RefundType::Full, R::PartialSuccess), BillStatus::PartiallyRefunded);
    }

    #[test]
    fn exhausted_bills_are_forced_to_refunded() {
        assert_eq!(force_refunded(&bill(100, 0), BillStatus::PartiallyRefunded), BillStatus::Refunded);
        assert_eq!(force_refunded(&bill(100, 40), BillStatus::PartiallyRefunded), BillStatus::PartiallyRefunded);
        assert_eq!(force_refunded(&bill(0, 0), BillStatus::RefundFailed), BillStatus::RefundFailed);
    }

    mod rerun {
        use super::*;
        use crate::auth::Principal;
        use crate::clock::ManualClock;
        use crate::ids::RequestId;
        use crate::payments::gateway::SimulatedGateway;
        use crate::payments::repository::InMemoryPaymentRepository;
        use crate::payments::service::{NewBill, NewPayment, PaymentService};
        use crate::tenancy::{NewTenant, TenantDirectory, TenantState};

        struct Fixture {
            repository: Arc<InMemoryPaymentRepository>,
            refunds: RefundOrchestrator,
            payment: Transaction,
            tenant: TenantContext,
        }

        fn fixture() -> Fixture {
            let clock: SharedClock = Arc::new(ManualClock::default());
            let directory = TenantDirectory::new("admin.resido.test", clock.clone());
            let tenant = directory
                .provision(NewTenant {
                    schema: "alder".into(),
                    domain: "alder.resido.test".into(),
                    name: "Alder".into(),
                    state: TenantState::Active,
                })
                .expect("tenant provisions");
            let tenant = directory.bind(tenant).context().clone();
            let repository = Arc::new(InMemoryPaymentRepository::new());
            let gateways = GatewayRouter::new(Arc::new(SimulatedGateway::new()));
            let payments = PaymentService::new(repository.clone(), gateways.clone(), clock.clone());
            let ctx = RequestContext::new(tenant.clone(), Principal::system(), RequestId::new());
            let bill = payments
                .create_bill(
                    &ctx,
                    NewBill {
                        resident_id: crate::ids::ResidentId::new(),
                        location: Default::default(),
                        amount: 300,
                        currency: "USD".to_string(),
                        display_id: None,
                    },
                )
                .expect("bill");
            let payment = payments
                .record_payment(
                    &ctx,
                    bill.id,
                    NewPayment {
                        method: TransactionMethod::Cash,
                        amount: 300,
                        currency: "USD".to_string(),
                        gateway_txn_id: None,
                        gateway_status: None,
                        status: TransactionStatus::Completed,
                        idempotency_key: None,
                    },
                )
                .expect("payment");
            Fixture {
                refunds: RefundOrchestrator::new(repository.clone(), gateways, Arc::new(EventBus::new()), clock),
                repository,
                payment,
                tenant,
            }
        }

        fn refund_line(parent: &Transaction, method: TransactionMethod, amount: i64) -> Transaction {
            Transaction {
                id: TransactionId::new(),
                kind: TransactionKind::Refund,
                method,
                amount,
                refunded_amount: 0,
                parent: Some(parent.id),
                status: TransactionStatus::Pending,
                idempotency_key: format!("rerun:{method:?}"),
                methodology: None,
                ..parent.clone()
            }
        }

        async fn apply_completed(fx: &Fixture, refund: &Transaction) -> i64 {
            let parent = refund.parent.expect("parent");
            match fx.refunds.apply(&fx.tenant, refund, parent).await.expect("applied") {
                (Step::Completed(booked), _) => booked,
                _ => panic!("line did not complete"),
            }
        }

        #[tokio::test]
        async fn lines_rerun_before_their_outcome_was_recorded_apply_once() {
            let fx = fixture();
            let wallet = refund_line(&fx.payment, TransactionMethod::Wallet, 40);
            let write_off = refund_line(&fx.payment, TransactionMethod::WriteOff, 60);

            for _ in 0..2 {
                assert_eq!(apply_completed(&fx, &wallet).await, 40);
                assert_eq!(apply_completed(&fx, &write_off).await, 60);
            }

            let balance = fx
                .repository
                .wallet(&fx.tenant, fx.payment.resident_id)
                .expect("wallet read")
                .expect("wallet exists")
                .balance;
            assert_eq!(balance, 40);
            let ledger = fx.repository.ledger_for_bill(&fx.tenant, fx.payment.bill_id).expect("ledger");
            assert_eq!(ledger.iter().filter(|entry| entry.transaction_id == write_off.id).count(), 1);

            // Neither line is recorded Completed yet, so each booking stands alone.
            let parent = fx
                .repository
                .transaction(&fx.tenant, fx.payment.id)
                .expect("read")
                .expect("parent");
            assert_eq!(parent.refunded_amount, 60);
            assert_eq!(parent.status, TransactionStatus::PartiallyRefunded);
        }
    }
}
