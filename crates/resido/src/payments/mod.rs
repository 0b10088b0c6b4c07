//! Bills, transactions and the refund and reconciliation pipelines.
//!
//! Money is held in minor units. Bill status moves only through the refund
//! orchestrator and the reconciler; [`PaymentService`] records payments and
//! recomputes the money columns but never touches refund statuses.

pub mod domain;
pub mod error;
pub mod gateway;
pub mod recon;
pub mod refund;
pub mod repository;
pub mod service;

pub use domain::{
    Bill, BillRefundRequest, BillStatus, LedgerEntry, LedgerKind, RefundMethodology,
    RefundRequestStatus, RefundType, Transaction, TransactionEvent, TransactionKind,
    TransactionLogEntry, TransactionMethod, TransactionStatus, Wallet,
};
pub use error::PaymentError;
pub use gateway::{GatewayRouter, GatewayStatus, PaymentGateway, SimulatedGateway};
pub use recon::{ReconReport, ReconciliationProcessor, TransactionReconciler};
pub use refund::{
    BillRefundProcessor, NewRefundLine, NewRefundRequest, RefundOrchestrator, RefundProcessWatcher,
    RefundReport, RefundRequestDetail, RefundRequestService, RefundSubmission,
};
pub use repository::{InMemoryPaymentRepository, PaymentRepository};
pub use service::{CardCharge, NewBill, NewPayment, PaymentService};
