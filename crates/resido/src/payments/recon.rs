use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::dispatch::{AsyncProcessor, ProcessorError, RunOutcome};
use crate::error::Classify;
use crate::events::{DomainEvent, EventBus};
use crate::ids::{RequestId, TransactionId};
use crate::process::{Process, ProcessType};
use crate::tenancy::TenantContext;

use super::domain::{RefundMethodology, Transaction, TransactionEvent, TransactionKind, TransactionStatus};
use super::error::PaymentError;
use super::gateway::{GatewayRouter, GatewayStatus, QueryKind};
use super::refund::RefundOrchestrator;
use super::repository::PaymentRepository;
use super::service::{log_event, payment_progress, settle_bill};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconReport {
    pub examined: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows modified concurrently; the next run picks them up again.
    pub skipped: usize,
    pub unknown_statuses: Vec<Value>,
    pub unresolved: Vec<TransactionId>,
    pub errors: Vec<Value>,
}

/// Compares local transactions with what the gateway reports and moves the
/// local rows forward. Concurrent runs are serialised per row by the
/// transaction's `version`.
pub struct TransactionReconciler {
    repository: Arc<dyn PaymentRepository>,
    gateways: GatewayRouter,
    refunds: Arc<RefundOrchestrator>,
    events: Arc<EventBus>,
    clock: SharedClock,
    window: Duration,
}

impl TransactionReconciler {
    pub fn new(
        repository: Arc<dyn PaymentRepository>,
        gateways: GatewayRouter,
        refunds: Arc<RefundOrchestrator>,
        events: Arc<EventBus>,
        clock: SharedClock,
        window: Duration,
    ) -> Self {
        Self {
            repository,
            gateways,
            refunds,
            events,
            clock,
            window,
        }
    }

    pub async fn reconcile(&self, ctx: &TenantContext, request_id: RequestId) -> Result<ReconReport, PaymentError> {
        let cutoff = self.clock.now() - self.window;
        let candidates = self.repository.reconciliation_candidates(ctx, cutoff)?;
        let mut report = ReconReport::default();

        for txn in candidates {
            report.examined += 1;
            let txn_id = txn.id;
            match self.reconcile_one(ctx, request_id, txn, cutoff, &mut report).await {
                Ok(()) => {}
                Err(PaymentError::VersionConflict { .. }) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(
                        tenant = %ctx.schema(),
                        transaction_id = %txn_id,
                        error = %err,
                        "reconciliation of transaction failed"
                    );
                    report.errors.push(json!({
                        "transaction_id": txn_id,
                        "code": err.code(),
                        "message": err.to_string(),
                    }));
                }
            }
        }

        tracing::info!(
            tenant = %ctx.schema(),
            request_id = %request_id,
            examined = report.examined,
            updated = report.updated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        ctx: &TenantContext,
        request_id: RequestId,
        mut txn: Transaction,
        cutoff: DateTime<Utc>,
        report: &mut ReconReport,
    ) -> Result<(), PaymentError> {
        let parent = match txn.parent {
            Some(parent_id) => Some(
                self.repository
                    .transaction(ctx, parent_id)?
                    .ok_or(PaymentError::TransactionNotFound(parent_id))?,
            ),
            None => None,
        };
        if txn.kind == TransactionKind::Refund && parent.is_none() {
            return Err(PaymentError::MissingParent(txn.id));
        }

        // A refund without its own gateway id can only be judged through its parent.
        let through_parent = txn.gateway_txn_id.is_none();
        let (gateway_txn_id, method) = match (&txn.gateway_txn_id, &parent) {
            (Some(id), Some(parent)) => (id.clone(), parent.method),
            (Some(id), None) => (id.clone(), txn.method),
            (None, Some(parent)) => match &parent.gateway_txn_id {
                Some(id) => (id.clone(), parent.method),
                None => {
                    report.unresolved.push(txn.id);
                    return Ok(());
                }
            },
            (None, None) => {
                report.unresolved.push(txn.id);
                return Ok(());
            }
        };

        let status = self
            .gateways
            .for_method(method)
            .query_transaction(&gateway_txn_id, QueryKind::for_method(method))
            .await?;
        let now = self.clock.now();
        log_event(
            self.repository.as_ref(),
            ctx,
            txn.id,
            TransactionEvent::ReconcileGateway,
            json!({
                "request_id": request_id,
                "gateway_txn_id": gateway_txn_id,
                "gateway_status": status.as_str(),
            }),
            now,
        )?;
        if !status.is_known() {
            report.unknown_statuses.push(json!({
                "transaction_id": txn.id,
                "gateway_status": status.as_str(),
            }));
        }

        let previous = txn.status;
        let next = match (&parent, through_parent) {
            (Some(parent), true) => match status {
                GatewayStatus::Void => {
                    txn.methodology = Some(RefundMethodology::Void);
                    txn.amount = self.refunds.void_amount(ctx, parent, txn.id)?;
                    TransactionStatus::Completed
                }
                GatewayStatus::Failed => {
                    txn.error_body = Some(unconfirmed(
                        "refund_parent_failed",
                        "the parent payment failed at the gateway",
                    ));
                    TransactionStatus::RefundFailed
                }
                // Nothing but a void shows on the parent; past the window the
                // call is taken as never having reached the gateway.
                _ if txn.created_at < cutoff => {
                    txn.error_body = Some(unconfirmed(
                        "refund_unconfirmed",
                        "the gateway never confirmed the refund within the reconciliation window",
                    ));
                    TransactionStatus::RefundFailed
                }
                _ => {
                    report.unresolved.push(txn.id);
                    previous
                }
            },
            _ => next_status(&txn, &status),
        };

        if !through_parent {
            txn.gateway_status = Some(status.as_str().to_string());
        }
        txn.status = next;
        txn.last_recon_request_id = Some(request_id);
        txn.last_recon_at = Some(now);
        txn.updated_at = now;
        let txn = self.repository.update_transaction(ctx, txn)?;
        let changed = previous != txn.status;

        if changed {
            report.updated += 1;
            self.follow_up(ctx, &txn)?;
        } else {
            report.unchanged += 1;
        }

        self.events.publish(
            ctx,
            DomainEvent::TransactionReconciled {
                transaction_id: txn.id,
                bill_id: txn.bill_id,
                gateway_status: status.as_str().to_string(),
                status: txn.status,
                changed,
            },
        );
        Ok(())
    }

    /// Carries a changed row into its parent, refund request and bill.
    fn follow_up(&self, ctx: &TenantContext, txn: &Transaction) -> Result<(), PaymentError> {
        match txn.kind {
            TransactionKind::Payment => {
                settle_bill(self.repository.as_ref(), ctx, txn.bill_id, self.clock.now(), payment_progress)?;
            }
            TransactionKind::Refund => {
                if txn.status == TransactionStatus::Completed {
                    self.refunds.propagate(ctx, txn, txn.methodology)?;
                }
                match txn.refund_request {
                    Some(request) => {
                        self.refunds.conclude(ctx, request)?;
                    }
                    None => {
                        settle_bill(self.repository.as_ref(), ctx, txn.bill_id, self.clock.now(), |_| None)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn unconfirmed(code: &str, message: &str) -> Value {
    json!({
        "status": false,
        "errors": [{ "code": code, "message": message }],
    })
}

/// Local status implied by a gateway status. Captured payments only move
/// when the gateway reports them failed or voided; refunded ones never move.
fn next_status(txn: &Transaction, status: &GatewayStatus) -> TransactionStatus {
    let mapped = status.local_status();
    match (txn.kind, txn.status) {
        (TransactionKind::Payment, TransactionStatus::Pending) => mapped,
        (TransactionKind::Payment, TransactionStatus::Completed) => match mapped {
            TransactionStatus::Failed | TransactionStatus::Cancelled => mapped,
            _ => txn.status,
        },
        (TransactionKind::Refund, TransactionStatus::Pending) => match mapped {
            TransactionStatus::Failed | TransactionStatus::Cancelled => TransactionStatus::RefundFailed,
            other => other,
        },
        (_, current) => current,
    }
}

/// Runs reconciliation for `TRANSACTIONS_RECONCILIATION` processes, periodic
/// or adhoc.
pub struct ReconciliationProcessor {
    reconciler: Arc<TransactionReconciler>,
}

impl ReconciliationProcessor {
    pub fn new(reconciler: Arc<TransactionReconciler>) -> Self {
        Self { reconciler }
    }
}

#[async_trait]
impl AsyncProcessor for ReconciliationProcessor {
    fn process_type(&self) -> ProcessType {
        ProcessType::TransactionsReconciliation
    }

    async fn run(&self, ctx: &RequestContext, process: &Process, _payload: &Value) -> Result<RunOutcome, ProcessorError> {
        let report = self
            .reconciler
            .reconcile(ctx.tenant()?, process.request_id)
            .await?;
        Ok(RunOutcome::completed(RunOutcome::report_value(&report)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn txn(kind: TransactionKind, status: TransactionStatus) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TransactionId::new(),
            bill_id: crate::ids::BillId::new(),
            resident_id: crate::ids::ResidentId::new(),
            location: Default::default(),
            kind,
            method: super::super::domain::TransactionMethod::OnlineCard,
            amount: 100,
            currency: "USD".to_string(),
            refunded_amount: 0,
            parent: None,
            refund_request: None,
            sequence: 0,
            status,
            gateway_status: None,
            gateway_txn_id: Some("TX".to_string()),
            idempotency_key: "k".to_string(),
            methodology: None,
            error_body: None,
            gateway_response: None,
            last_recon_request_id: None,
            last_recon_at: None,
            created_by: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    #[test]
    fn pending_payments_take_the_gateway_status() {
        let pending = txn(TransactionKind::Payment, TransactionStatus::Pending);
        assert_eq!(next_status(&pending, &GatewayStatus::Settled), TransactionStatus::Completed);
        assert_eq!(next_status(&pending, &GatewayStatus::Locked), TransactionStatus::Pending);
        assert_eq!(next_status(&pending, &GatewayStatus::Failed), TransactionStatus::Failed);
    }

    #[test]
    fn captured_payments_only_move_on_failure_or_void() {
        let completed = txn(TransactionKind::Payment, TransactionStatus::Completed);
        assert_eq!(next_status(&completed, &GatewayStatus::Settled), TransactionStatus::Completed);
        assert_eq!(next_status(&completed, &GatewayStatus::AuthOk), TransactionStatus::Completed);
        assert_eq!(next_status(&completed, &GatewayStatus::Void), TransactionStatus::Cancelled);

        let refunded = txn(TransactionKind::Payment, TransactionStatus::Refunded);
        assert_eq!(next_status(&refunded, &GatewayStatus::Void), TransactionStatus::Refunded);
    }

    #[test]
    fn failed_refunds_become_refund_failed() {
        let pending = txn(TransactionKind::Refund, TransactionStatus::Pending);
        assert_eq!(next_status(&pending, &GatewayStatus::Failed), TransactionStatus::RefundFailed);
        assert_eq!(next_status(&pending, &GatewayStatus::Settled), TransactionStatus::Completed);
    }
}
