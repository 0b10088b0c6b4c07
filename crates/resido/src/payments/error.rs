use crate::access::AccessError;
use crate::dispatch::DispatchError;
use crate::error::{Classify, ErrorKind};
use crate::ids::{BillId, RefundRequestId, TransactionId};
use crate::process::ProcessError;

use super::domain::TransactionMethod;
use super::gateway::GatewayError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PaymentError {
    #[error("bill {0} not found")]
    BillNotFound(BillId),
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),
    #[error("refund request {0} not found")]
    RefundRequestNotFound(RefundRequestId),
    #[error("{entity} {id} was modified concurrently")]
    VersionConflict { entity: &'static str, id: String },
    #[error("idempotency key '{0}' is already used")]
    DuplicateIdempotencyKey(String),
    #[error("bill {0} already has a refund request in progress")]
    RefundInProgress(BillId),
    #[error("a refund request needs at least one line")]
    EmptyRefund,
    #[error("amounts must be positive")]
    InvalidAmount,
    #[error("currency {found} does not match bill currency {expected}")]
    CurrencyMismatch { expected: String, found: String },
    #[error("{0} cannot be used as a refund method")]
    UnsupportedRefundMethod(TransactionMethod),
    #[error("transaction {parent} cannot be refunded: {reason}")]
    InvalidParent {
        parent: TransactionId,
        reason: &'static str,
    },
    #[error("refund of {requested} exceeds the {available} still refundable on transaction {parent}")]
    ExceedsParent {
        parent: TransactionId,
        requested: i64,
        available: i64,
    },
    #[error("payment of {requested} exceeds the {outstanding} still owed on bill {bill}")]
    ExceedsBalance {
        bill: BillId,
        requested: i64,
        outstanding: i64,
    },
    #[error("refund of {requested} exceeds the bill's refundable amount {refundable}")]
    ExceedsRefundable { requested: i64, refundable: i64 },
    #[error("a full refund must request exactly {refundable}, got {requested}")]
    FullRefundMismatch { requested: i64, refundable: i64 },
    #[error("refund transaction {0} has no parent payment")]
    MissingParent(TransactionId),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl Classify for PaymentError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BillNotFound(_) | Self::TransactionNotFound(_) | Self::RefundRequestNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::VersionConflict { .. } | Self::DuplicateIdempotencyKey(_) | Self::RefundInProgress(_) => {
                ErrorKind::Conflict
            }
            Self::EmptyRefund
            | Self::InvalidAmount
            | Self::CurrencyMismatch { .. }
            | Self::UnsupportedRefundMethod(_)
            | Self::InvalidParent { .. }
            | Self::ExceedsParent { .. }
            | Self::ExceedsBalance { .. }
            | Self::ExceedsRefundable { .. }
            | Self::FullRefundMismatch { .. } => ErrorKind::Validation,
            Self::MissingParent(_) => ErrorKind::Integrity,
            Self::Gateway(err) => err.kind(),
            Self::Process(err) => err.kind(),
            Self::Dispatch(err) => err.kind(),
            Self::Access(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BillNotFound(_) => "bill_not_found",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::RefundRequestNotFound(_) => "refund_request_not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::DuplicateIdempotencyKey(_) => "duplicate_idempotency_key",
            Self::RefundInProgress(_) => "refund_in_progress",
            Self::EmptyRefund => "empty_refund_request",
            Self::InvalidAmount => "invalid_amount",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::UnsupportedRefundMethod(_) => "unsupported_refund_method",
            Self::InvalidParent { .. } => "invalid_parent_transaction",
            Self::ExceedsParent { .. } => "refund_exceeds_parent",
            Self::ExceedsBalance { .. } => "payment_exceeds_balance",
            Self::ExceedsRefundable { .. } => "refund_exceeds_refundable",
            Self::FullRefundMismatch { .. } => "full_refund_amount_mismatch",
            Self::MissingParent(_) => "refund_without_parent",
            Self::Gateway(err) => err.code(),
            Self::Process(err) => err.code(),
            Self::Dispatch(err) => err.code(),
            Self::Access(err) => err.code(),
        }
    }
}
