use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::access::{LocationPath, RowScoped};
use crate::ids::{BillId, ProcessId, RefundRequestId, RequestId, ResidentId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Pending,
    PartiallyCompleted,
    Completed,
    RefundInitiated,
    PartialRefundInitiated,
    Refunded,
    PartiallyRefunded,
    RefundFailed,
    PartialRefundFailed,
    Cancelled,
}

impl BillStatus {
    /// Statuses owned by the refund pipeline. Reconciliation never moves a
    /// bill out of them.
    pub const fn is_refund_status(self) -> bool {
        matches!(
            self,
            Self::RefundInitiated
                | Self::PartialRefundInitiated
                | Self::Refunded
                | Self::PartiallyRefunded
                | Self::RefundFailed
                | Self::PartialRefundFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Payment,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionMethod {
    Cash,
    WriteOff,
    Adjustment,
    Wallet,
    BackToSource,
    PosTerminal,
    OnlineCard,
    OnlineAch,
}

impl TransactionMethod {
    /// Methods a refund line may use.
    pub const fn is_refund_method(self) -> bool {
        matches!(
            self,
            Self::Cash | Self::WriteOff | Self::Adjustment | Self::Wallet | Self::BackToSource
        )
    }
}

impl fmt::Display for TransactionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cash => "CASH",
            Self::WriteOff => "WRITE_OFF",
            Self::Adjustment => "ADJUSTMENT",
            Self::Wallet => "WALLET",
            Self::BackToSource => "BACK_TO_SOURCE",
            Self::PosTerminal => "POS_TERMINAL",
            Self::OnlineCard => "ONLINE_CARD",
            Self::OnlineAch => "ONLINE_ACH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    RefundFailed,
    PartiallyRefunded,
}

impl TransactionStatus {
    /// Payment statuses whose money was received by the property.
    pub const fn is_captured(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyRefunded | Self::Refunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundType {
    Full,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundRequestStatus {
    Pending,
    Completed,
    Failed,
    PartialSuccess,
}

/// How a refund was executed against its parent payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundMethodology {
    /// The open authorization was cancelled; the whole parent is refunded.
    Void,
    /// A settled credit was issued for the refund amount.
    Credit,
    Cash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionEvent {
    SaleGateway,
    QueryGateway,
    VoidGateway,
    CreditGateway,
    ReconcileGateway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    pub display_id: String,
    pub resident_id: ResidentId,
    pub location: LocationPath,
    pub amount: i64,
    pub currency: String,
    pub paid_amount: i64,
    pub refunded_amount: i64,
    pub refundable_amount: i64,
    pub status: BillStatus,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub version: u64,
}

impl Bill {
    /// Recomputes the money columns from the bill's transactions: paid is the
    /// sum of captured payments, refunded the sum of completed refunds.
    pub fn recompute(&mut self, transactions: &[Transaction]) {
        let paid: i64 = transactions
            .iter()
            .filter(|txn| txn.kind == TransactionKind::Payment && txn.status.is_captured())
            .map(|txn| txn.amount)
            .sum();
        let refunded: i64 = transactions
            .iter()
            .filter(|txn| txn.kind == TransactionKind::Refund && txn.status == TransactionStatus::Completed)
            .map(|txn| txn.amount)
            .sum();
        self.paid_amount = paid;
        self.refunded_amount = refunded;
        self.refundable_amount = (paid - refunded).max(0);
    }

    /// Status implied by the paid amount alone.
    pub fn payment_status(&self) -> BillStatus {
        if self.paid_amount <= 0 {
            BillStatus::Pending
        } else if self.paid_amount >= self.amount {
            BillStatus::Completed
        } else {
            BillStatus::PartiallyCompleted
        }
    }
}

impl RowScoped for Bill {
    fn location_path(&self) -> Option<&LocationPath> {
        Some(&self.location)
    }

    fn resident_path(&self) -> Option<ResidentId> {
        Some(self.resident_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub bill_id: BillId,
    pub resident_id: ResidentId,
    pub location: LocationPath,
    pub kind: TransactionKind,
    pub method: TransactionMethod,
    pub amount: i64,
    pub currency: String,
    pub refunded_amount: i64,
    pub parent: Option<TransactionId>,
    pub refund_request: Option<RefundRequestId>,
    /// Position inside its refund request; refunds are processed in order.
    pub sequence: u32,
    pub status: TransactionStatus,
    pub gateway_status: Option<String>,
    pub gateway_txn_id: Option<String>,
    pub idempotency_key: String,
    pub methodology: Option<RefundMethodology>,
    pub error_body: Option<Value>,
    pub gateway_response: Option<Value>,
    pub last_recon_request_id: Option<RequestId>,
    pub last_recon_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Transaction {
    /// Amount of a payment that has not been refunded yet.
    pub fn remaining(&self) -> i64 {
        (self.amount - self.refunded_amount).max(0)
    }
}

impl RowScoped for Transaction {
    fn location_path(&self) -> Option<&LocationPath> {
        Some(&self.location)
    }

    fn resident_path(&self) -> Option<ResidentId> {
        Some(self.resident_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillRefundRequest {
    pub id: RefundRequestId,
    pub display_id: String,
    pub bill_id: BillId,
    pub resident_id: ResidentId,
    pub location: LocationPath,
    pub refund_type: RefundType,
    pub total_amount_requested: i64,
    pub total_refund_processed: i64,
    pub currency: String,
    pub status: RefundRequestStatus,
    pub process_id: Option<ProcessId>,
    pub reason: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl RowScoped for BillRefundRequest {
    fn location_path(&self) -> Option<&LocationPath> {
        Some(&self.location)
    }

    fn resident_path(&self) -> Option<ResidentId> {
        Some(self.resident_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub resident_id: ResidentId,
    pub balance: i64,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    WriteOff,
    Adjustment,
}

/// Accounting entry recorded for write-off and adjustment refunds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub kind: LedgerKind,
    pub bill_id: BillId,
    pub transaction_id: TransactionId,
    pub amount: i64,
    pub currency: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub event: TransactionEvent,
    pub data: Value,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(kind: TransactionKind, amount: i64, status: TransactionStatus) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: TransactionId::new(),
            bill_id: BillId::new(),
            resident_id: ResidentId::new(),
            location: LocationPath::default(),
            kind,
            method: TransactionMethod::OnlineCard,
            amount,
            currency: "USD".into(),
            refunded_amount: 0,
            parent: None,
            refund_request: None,
            sequence: 0,
            status,
            gateway_status: None,
            gateway_txn_id: None,
            idempotency_key: Uuid::new_v4().to_string(),
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

    fn bill(amount: i64) -> Bill {
        let now = Utc::now();
        Bill {
            id: BillId::new(),
            display_id: "BILL-1".into(),
            resident_id: ResidentId::new(),
            location: LocationPath::default(),
            amount,
            currency: "USD".into(),
            paid_amount: 0,
            refunded_amount: 0,
            refundable_amount: 0,
            status: BillStatus::Pending,
            created_by: None,
            created_at: now,
            updated_at: now,
            deleted: false,
            version: 0,
        }
    }

    #[test]
    fn recompute_counts_captured_payments_and_completed_refunds() {
        let mut bill = bill(300_00);
        let transactions = vec![
            txn(TransactionKind::Payment, 200_00, TransactionStatus::PartiallyRefunded),
            txn(TransactionKind::Payment, 100_00, TransactionStatus::Completed),
            txn(TransactionKind::Payment, 50_00, TransactionStatus::Failed),
            txn(TransactionKind::Refund, 50_00, TransactionStatus::Completed),
            txn(TransactionKind::Refund, 25_00, TransactionStatus::RefundFailed),
        ];
        bill.recompute(&transactions);

        assert_eq!(bill.paid_amount, 300_00);
        assert_eq!(bill.refunded_amount, 50_00);
        assert_eq!(bill.refundable_amount, 250_00);
        assert_eq!(bill.payment_status(), BillStatus::Completed);
    }

    #[test]
    fn payment_status_tracks_paid_amount() {
        let mut bill = bill(100_00);
        assert_eq!(bill.payment_status(), BillStatus::Pending);
        bill.paid_amount = 40_00;
        assert_eq!(bill.payment_status(), BillStatus::PartiallyCompleted);
    }
}
