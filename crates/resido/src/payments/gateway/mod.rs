//! Payment gateway seam and its adapters.
//!
//! Every adapter exposes the same capability set. Gateway statuses are mapped
//! onto local transaction statuses by [`GatewayStatus::local_status`], which is
//! total: unrecognised statuses land on Pending for reconciliation to revisit.

mod card_ach;
mod deadline;
mod null;
mod router;
mod simulated;
mod terminal;

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Classify, ErrorKind};

use super::domain::{RefundMethodology, TransactionMethod, TransactionStatus};

pub use card_ach::CardAchGateway;
pub use deadline::DeadlineGateway;
pub use null::NullGateway;
pub use router::GatewayRouter;
pub use simulated::SimulatedGateway;
pub use terminal::TerminalGateway;

/// Status vocabulary reported by the card/ACH processor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GatewayStatus {
    Open,
    Settled,
    Failed,
    Locked,
    Void,
    AuthOk,
    Unknown(String),
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Self::Open,
            "SETTLED" => Self::Settled,
            "FAILED" => Self::Failed,
            "LOCKED" => Self::Locked,
            "VOID" => Self::Void,
            "AUTHOK" => Self::AuthOk,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "OPEN",
            Self::Settled => "SETTLED",
            Self::Failed => "FAILED",
            Self::Locked => "LOCKED",
            Self::Void => "VOID",
            Self::AuthOk => "AUTHOK",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    pub fn local_status(&self) -> TransactionStatus {
        match self {
            Self::Open | Self::Settled => TransactionStatus::Completed,
            Self::Failed => TransactionStatus::Failed,
            Self::Void => TransactionStatus::Cancelled,
            Self::Locked | Self::AuthOk | Self::Unknown(_) => TransactionStatus::Pending,
        }
    }

    /// How a refund against a payment in this status is executed, if at all.
    /// Unsettled authorizations are voided; settled captures get a credit.
    pub fn refund_methodology(&self) -> Option<RefundMethodology> {
        match self {
            Self::Open | Self::AuthOk => Some(RefundMethodology::Void),
            Self::Settled => Some(RefundMethodology::Credit),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which query endpoint a transaction lives behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Card,
    Ach,
}

impl QueryKind {
    pub fn for_method(method: TransactionMethod) -> Self {
        match method {
            TransactionMethod::OnlineAch => Self::Ach,
            _ => Self::Card,
        }
    }
}

/// Money and idempotency data common to every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub idempotency_key: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDetails {
    pub token: String,
    pub holder_name: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallmentTerms {
    pub count: u32,
    pub first_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDetails {
    pub account_token: String,
    pub routing_number: String,
    pub holder_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResult {
    pub approved: bool,
    pub gateway_txn_id: Option<String>,
    pub gateway_status: GatewayStatus,
    pub response: Value,
}

/// Data a point-of-sale terminal needs to start a payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosSession {
    pub reference: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundCall {
    pub parent_gateway_txn_id: String,
    pub parent_method: TransactionMethod,
    pub charge: GatewayCharge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundDisposition {
    Approved,
    Declined,
    /// The outcome is unknown, typically after a deadline; reconciliation
    /// resolves it later.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundResult {
    pub disposition: RefundDisposition,
    pub methodology: Option<RefundMethodology>,
    /// Gateway id of the credit, when one was issued.
    pub gateway_txn_id: Option<String>,
    pub response: Value,
}

impl RefundResult {
    pub fn declined(response: Value) -> Self {
        Self {
            disposition: RefundDisposition::Declined,
            methodology: None,
            gateway_txn_id: None,
            response,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("no payment gateway is configured for {0}")]
    NotConfigured(String),
    #[error("{gateway} does not support {operation}")]
    Unsupported {
        gateway: &'static str,
        operation: &'static str,
    },
    #[error("gateway rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected gateway response: {0}")]
    Malformed(String),
}

impl Classify for GatewayError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::NotConfigured(_) => ErrorKind::Unavailable,
            Self::Unsupported { .. } | Self::Rejected(_) => ErrorKind::Validation,
            Self::Malformed(_) => ErrorKind::Internal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "gateway_unavailable",
            Self::NotConfigured(_) => "gateway_not_configured",
            Self::Unsupported { .. } => "gateway_operation_unsupported",
            Self::Rejected(_) => "gateway_rejected",
            Self::Malformed(_) => "gateway_malformed_response",
        }
    }
}

/// Capability set every gateway adapter provides.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process_card_payment(
        &self,
        charge: &GatewayCharge,
        card: &CardDetails,
        cvv: &str,
        installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError>;

    async fn process_account_payment(
        &self,
        charge: &GatewayCharge,
        account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError>;

    async fn prepare_pos_payment(&self, charge: &GatewayCharge) -> Result<PosSession, GatewayError>;

    /// Refunds part or all of a captured payment. The adapter looks up the
    /// parent's current status and picks the methodology from it.
    async fn refund(&self, call: &RefundCall) -> Result<RefundResult, GatewayError>;

    async fn query_transaction(&self, gateway_txn_id: &str, kind: QueryKind) -> Result<GatewayStatus, GatewayError>;
}

/// Minor units to the decimal amount gateways expect on the wire.
pub(crate) fn to_major_units(amount: i64) -> f64 {
    amount as f64 / 100.0
}
