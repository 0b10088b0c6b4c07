use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::access::LocationPath;
use crate::auth::RequestContext;
use crate::clock::SharedClock;
use crate::ids::{BillId, ResidentId, TransactionId};
use crate::tenancy::TenantContext;

use super::domain::{
    Bill, BillStatus, LedgerEntry, Transaction, TransactionEvent, TransactionKind,
    TransactionLogEntry, TransactionMethod, TransactionStatus, Wallet,
};
use super::error::PaymentError;
use super::gateway::{CardDetails, GatewayCharge, GatewayRouter, InstallmentTerms};
use super::repository::PaymentRepository;

const CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct NewBill {
    pub resident_id: ResidentId,
    #[serde(default)]
    pub location: LocationPath,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub display_id: Option<String>,
}

/// A payment captured outside the card/ACH flow (cash at the desk, a POS
/// receipt, an imported settlement).
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub method: TransactionMethod,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub gateway_txn_id: Option<String>,
    #[serde(default)]
    pub gateway_status: Option<String>,
    #[serde(default = "completed")]
    pub status: TransactionStatus,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn completed() -> TransactionStatus {
    TransactionStatus::Completed
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardCharge {
    pub amount: i64,
    pub currency: String,
    pub card: CardDetails,
    pub cvv: String,
    #[serde(default)]
    pub installments: Option<InstallmentTerms>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Bill and payment bookkeeping. Every read applies the caller's row filter;
/// rows outside it are reported as missing.
pub struct PaymentService {
    repository: Arc<dyn PaymentRepository>,
    gateways: GatewayRouter,
    clock: SharedClock,
}

impl PaymentService {
    pub fn new(repository: Arc<dyn PaymentRepository>, gateways: GatewayRouter, clock: SharedClock) -> Self {
        Self {
            repository,
            gateways,
            clock,
        }
    }

    pub fn repository(&self) -> &Arc<dyn PaymentRepository> {
        &self.repository
    }

    pub fn create_bill(&self, ctx: &RequestContext, new: NewBill) -> Result<Bill, PaymentError> {
        let tenant = ctx.tenant()?;
        if new.amount <= 0 {
            return Err(PaymentError::InvalidAmount);
        }
        let now = self.clock.now();
        let id = BillId::new();
        let bill = Bill {
            id,
            display_id: new.display_id.unwrap_or_else(|| display_id("BILL", id.as_uuid())),
            resident_id: new.resident_id,
            location: new.location,
            amount: new.amount,
            currency: new.currency,
            paid_amount: 0,
            refunded_amount: 0,
            refundable_amount: 0,
            status: BillStatus::Pending,
            created_by: Some(ctx.actor()),
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 0,
        };
        let bill = self.repository.insert_bill(tenant, bill)?;
        tracing::info!(tenant = %tenant.schema(), bill_id = %bill.id, amount = bill.amount, "bill created");
        Ok(bill)
    }

    pub fn bill(&self, ctx: &RequestContext, id: BillId) -> Result<Bill, PaymentError> {
        let tenant = ctx.tenant()?;
        self.repository
            .bill(tenant, id)?
            .filter(|bill| ctx.row_filter().permits(bill))
            .ok_or(PaymentError::BillNotFound(id))
    }

    pub fn transactions(&self, ctx: &RequestContext, bill_id: BillId) -> Result<Vec<Transaction>, PaymentError> {
        let bill = self.bill(ctx, bill_id)?;
        let rows = self.repository.transactions_for_bill(ctx.tenant()?, bill.id)?;
        Ok(ctx.row_filter().apply(rows))
    }

    pub fn transaction(&self, ctx: &RequestContext, id: TransactionId) -> Result<Transaction, PaymentError> {
        self.repository
            .transaction(ctx.tenant()?, id)?
            .filter(|txn| ctx.row_filter().permits(txn))
            .ok_or(PaymentError::TransactionNotFound(id))
    }

    pub fn logs(&self, ctx: &RequestContext, id: TransactionId) -> Result<Vec<TransactionLogEntry>, PaymentError> {
        let txn = self.transaction(ctx, id)?;
        self.repository.logs_for(ctx.tenant()?, txn.id)
    }

    pub fn ledger(&self, ctx: &RequestContext, bill_id: BillId) -> Result<Vec<LedgerEntry>, PaymentError> {
        let bill = self.bill(ctx, bill_id)?;
        self.repository.ledger_for_bill(ctx.tenant()?, bill.id)
    }

    pub fn wallet(&self, ctx: &RequestContext, resident: ResidentId) -> Result<Option<Wallet>, PaymentError> {
        if !ctx.row_filter().permits(&ResidentRow(resident)) {
            return Ok(None);
        }
        self.repository.wallet(ctx.tenant()?, resident)
    }

    /// Records a payment and recomputes the bill.
    pub fn record_payment(
        &self,
        ctx: &RequestContext,
        bill_id: BillId,
        payment: NewPayment,
    ) -> Result<Transaction, PaymentError> {
        let bill = self.bill(ctx, bill_id)?;
        if payment.amount <= 0 {
            return Err(PaymentError::InvalidAmount);
        }
        if payment.currency != bill.currency {
            return Err(PaymentError::CurrencyMismatch {
                expected: bill.currency,
                found: payment.currency,
            });
        }
        let tenant = ctx.tenant()?;
        self.ensure_within_balance(tenant, &bill, payment.amount)?;
        let mut txn = self.new_payment(ctx, &bill, payment.method, payment.amount, payment.idempotency_key);
        txn.status = payment.status;
        txn.gateway_txn_id = payment.gateway_txn_id;
        txn.gateway_status = payment.gateway_status;

        let txn = self.repository.insert_transaction(tenant, txn)?;
        settle_bill(self.repository.as_ref(), tenant, bill.id, self.clock.now(), payment_progress)?;
        tracing::info!(
            tenant = %tenant.schema(),
            bill_id = %bill.id,
            transaction_id = %txn.id,
            method = %txn.method,
            status = ?txn.status,
            "payment recorded"
        );
        Ok(txn)
    }

    /// Charges a card through the gateway. The transaction is stored Pending
    /// before the call so a crash mid-call leaves a row for reconciliation.
    pub async fn charge_card(
        &self,
        ctx: &RequestContext,
        bill_id: BillId,
        charge: CardCharge,
    ) -> Result<Transaction, PaymentError> {
        let bill = self.bill(ctx, bill_id)?;
        if charge.amount <= 0 {
            return Err(PaymentError::InvalidAmount);
        }
        if charge.currency != bill.currency {
            return Err(PaymentError::CurrencyMismatch {
                expected: bill.currency,
                found: charge.currency,
            });
        }
        let tenant = ctx.tenant()?;
        self.ensure_within_balance(tenant, &bill, charge.amount)?;
        let mut txn = self.new_payment(ctx, &bill, TransactionMethod::OnlineCard, charge.amount, charge.idempotency_key);
        txn.status = TransactionStatus::Pending;
        let mut txn = self.repository.insert_transaction(tenant, txn)?;

        let request = GatewayCharge {
            idempotency_key: txn.idempotency_key.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
        };
        let gateway = self.gateways.for_method(txn.method);
        let result = gateway
            .process_card_payment(&request, &charge.card, &charge.cvv, charge.installments.as_ref())
            .await;

        let now = self.clock.now();
        match result {
            Ok(result) => {
                log_event(
                    self.repository.as_ref(),
                    tenant,
                    txn.id,
                    TransactionEvent::SaleGateway,
                    json!({
                        "approved": result.approved,
                        "gateway_status": result.gateway_status.as_str(),
                        "response": result.response,
                    }),
                    now,
                )?;
                txn.status = if result.approved {
                    result.gateway_status.local_status()
                } else if result.gateway_status.is_known() {
                    TransactionStatus::Failed
                } else {
                    TransactionStatus::Pending
                };
                txn.gateway_txn_id = result.gateway_txn_id;
                txn.gateway_status = Some(result.gateway_status.as_str().to_string());
                txn.gateway_response = Some(result.response);
            }
            Err(err) => {
                log_event(
                    self.repository.as_ref(),
                    tenant,
                    txn.id,
                    TransactionEvent::SaleGateway,
                    json!({ "error": err.to_string() }),
                    now,
                )?;
                txn.status = TransactionStatus::Failed;
                txn.error_body = Some(error_body(&err));
            }
        }
        txn.updated_at = now;
        let txn = self.repository.update_transaction(tenant, txn)?;
        settle_bill(self.repository.as_ref(), tenant, bill.id, now, payment_progress)?;
        Ok(txn)
    }

    /// Captured and in-flight payments together never exceed the bill.
    fn ensure_within_balance(&self, tenant: &TenantContext, bill: &Bill, amount: i64) -> Result<(), PaymentError> {
        let committed: i64 = self
            .repository
            .transactions_for_bill(tenant, bill.id)?
            .iter()
            .filter(|txn| {
                txn.kind == TransactionKind::Payment
                    && (txn.status.is_captured() || txn.status == TransactionStatus::Pending)
            })
            .map(|txn| txn.amount)
            .sum();
        let outstanding = (bill.amount - committed).max(0);
        if amount > outstanding {
            return Err(PaymentError::ExceedsBalance {
                bill: bill.id,
                requested: amount,
                outstanding,
            });
        }
        Ok(())
    }

    fn new_payment(
        &self,
        ctx: &RequestContext,
        bill: &Bill,
        method: TransactionMethod,
        amount: i64,
        idempotency_key: Option<String>,
    ) -> Transaction {
        let now = self.clock.now();
        let id = TransactionId::new();
        Transaction {
            id,
            bill_id: bill.id,
            resident_id: bill.resident_id,
            location: bill.location.clone(),
            kind: TransactionKind::Payment,
            method,
            amount,
            currency: bill.currency.clone(),
            refunded_amount: 0,
            parent: None,
            refund_request: None,
            sequence: 0,
            status: TransactionStatus::Completed,
            gateway_status: None,
            gateway_txn_id: None,
            idempotency_key: idempotency_key.unwrap_or_else(|| id.to_string()),
            methodology: None,
            error_body: None,
            gateway_response: None,
            last_recon_request_id: None,
            last_recon_at: None,
            created_by: Some(ctx.actor()),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

struct ResidentRow(ResidentId);

impl crate::access::RowScoped for ResidentRow {
    fn resident_path(&self) -> Option<ResidentId> {
        Some(self.0)
    }
}

/// Status a bill takes from its paid amount, unless the refund pipeline
/// owns it.
pub(crate) fn payment_progress(bill: &Bill) -> Option<BillStatus> {
    if bill.status.is_refund_status() || bill.status == BillStatus::Cancelled {
        None
    } else {
        Some(bill.payment_status())
    }
}

/// Recomputes a bill's money columns from its transactions and applies the
/// status chosen by `decide`. Retries on concurrent modification.
pub(crate) fn settle_bill(
    repository: &dyn PaymentRepository,
    ctx: &TenantContext,
    bill_id: BillId,
    now: DateTime<Utc>,
    decide: impl Fn(&Bill) -> Option<BillStatus>,
) -> Result<Bill, PaymentError> {
    for _ in 0..CONFLICT_RETRIES {
        let mut bill = repository
            .bill(ctx, bill_id)?
            .ok_or(PaymentError::BillNotFound(bill_id))?;
        let transactions = repository.transactions_for_bill(ctx, bill_id)?;
        bill.recompute(&transactions);
        if let Some(status) = decide(&bill) {
            bill.status = status;
        }
        bill.updated_at = now;
        match repository.update_bill(ctx, bill) {
            Err(PaymentError::VersionConflict { .. }) => continue,
            other => return other,
        }
    }
    Err(PaymentError::VersionConflict {
        entity: "bill",
        id: bill_id.to_string(),
    })
}

pub(crate) fn log_event(
    repository: &dyn PaymentRepository,
    ctx: &TenantContext,
    transaction_id: TransactionId,
    event: TransactionEvent,
    data: Value,
    at: DateTime<Utc>,
) -> Result<(), PaymentError> {
    repository.append_log(
        ctx,
        TransactionLogEntry {
            id: Uuid::new_v4(),
            transaction_id,
            event,
            data,
            recorded_at: at,
        },
    )
}

pub(crate) fn error_body<E: crate::error::Classify + std::fmt::Display>(err: &E) -> Value {
    json!({
        "status": false,
        "errors": [{ "code": err.code(), "message": err.to_string() }],
    })
}

pub(crate) fn display_id(prefix: &str, id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("{prefix}-{}", simple[..8].to_ascii_uppercase())
}
