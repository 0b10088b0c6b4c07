use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::access::Partitioned;
use crate::ids::{BillId, RefundRequestId, ResidentId, TransactionId};
use crate::tenancy::TenantContext;

use super::domain::{
    Bill, BillRefundRequest, LedgerEntry, Transaction, TransactionKind, TransactionLogEntry,
    TransactionStatus, Wallet,
};
use super::error::PaymentError;

/// Tenant-scoped storage for bills, transactions and refund requests.
/// Updates of versioned rows fail with [`PaymentError::VersionConflict`]
/// when the caller's copy is stale.
pub trait PaymentRepository: Send + Sync {
    fn insert_bill(&self, ctx: &TenantContext, bill: Bill) -> Result<Bill, PaymentError>;
    fn update_bill(&self, ctx: &TenantContext, bill: Bill) -> Result<Bill, PaymentError>;
    fn bill(&self, ctx: &TenantContext, id: BillId) -> Result<Option<Bill>, PaymentError>;

    /// Fails with [`PaymentError::DuplicateIdempotencyKey`] when the key is taken.
    fn insert_transaction(&self, ctx: &TenantContext, txn: Transaction) -> Result<Transaction, PaymentError>;
    fn update_transaction(&self, ctx: &TenantContext, txn: Transaction) -> Result<Transaction, PaymentError>;
    fn transaction(&self, ctx: &TenantContext, id: TransactionId) -> Result<Option<Transaction>, PaymentError>;
    fn transaction_by_key(&self, ctx: &TenantContext, key: &str) -> Result<Option<Transaction>, PaymentError>;
    fn transactions_for_bill(&self, ctx: &TenantContext, bill: BillId) -> Result<Vec<Transaction>, PaymentError>;
    /// Refund rows of a request in processing order.
    fn refunds_for_request(
        &self,
        ctx: &TenantContext,
        request: RefundRequestId,
    ) -> Result<Vec<Transaction>, PaymentError>;
    /// Transactions with a gateway id that are Pending or were last
    /// reconciled before `cutoff`, plus refunds whose gateway call ended
    /// without a known outcome.
    fn reconciliation_candidates(
        &self,
        ctx: &TenantContext,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, PaymentError>;

    fn insert_refund_request(
        &self,
        ctx: &TenantContext,
        request: BillRefundRequest,
    ) -> Result<BillRefundRequest, PaymentError>;
    fn update_refund_request(
        &self,
        ctx: &TenantContext,
        request: BillRefundRequest,
    ) -> Result<BillRefundRequest, PaymentError>;
    fn refund_request(
        &self,
        ctx: &TenantContext,
        id: RefundRequestId,
    ) -> Result<Option<BillRefundRequest>, PaymentError>;
    fn refund_requests_for_bill(
        &self,
        ctx: &TenantContext,
        bill: BillId,
    ) -> Result<Vec<BillRefundRequest>, PaymentError>;

    /// Credits the resident's wallet once per `reference`; a repeated
    /// reference returns the wallet unchanged.
    fn credit_wallet(
        &self,
        ctx: &TenantContext,
        resident: ResidentId,
        reference: TransactionId,
        amount: i64,
        currency: &str,
        at: DateTime<Utc>,
    ) -> Result<Wallet, PaymentError>;
    fn wallet(&self, ctx: &TenantContext, resident: ResidentId) -> Result<Option<Wallet>, PaymentError>;

    /// One entry per transaction; appending a second one for the same
    /// transaction is a no-op.
    fn append_ledger(&self, ctx: &TenantContext, entry: LedgerEntry) -> Result<(), PaymentError>;
    fn ledger_for_bill(&self, ctx: &TenantContext, bill: BillId) -> Result<Vec<LedgerEntry>, PaymentError>;

    fn append_log(&self, ctx: &TenantContext, entry: TransactionLogEntry) -> Result<(), PaymentError>;
    fn logs_for(&self, ctx: &TenantContext, txn: TransactionId) -> Result<Vec<TransactionLogEntry>, PaymentError>;
}

#[derive(Debug, Default)]
struct PaymentPartition {
    bills: HashMap<BillId, Bill>,
    transactions: HashMap<TransactionId, Transaction>,
    idempotency: HashMap<String, TransactionId>,
    refund_requests: HashMap<RefundRequestId, BillRefundRequest>,
    wallets: HashMap<ResidentId, Wallet>,
    wallet_credits: HashSet<TransactionId>,
    ledger: Vec<LedgerEntry>,
    logs: Vec<TransactionLogEntry>,
}

pub struct InMemoryPaymentRepository {
    partitions: Partitioned<PaymentPartition>,
}

impl Default for InMemoryPaymentRepository {
    fn default() -> Self {
        Self {
            partitions: Partitioned::tenant_only("payment"),
        }
    }
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn conflict(entity: &'static str, id: impl ToString) -> PaymentError {
    PaymentError::VersionConflict {
        entity,
        id: id.to_string(),
    }
}

impl PaymentRepository for InMemoryPaymentRepository {
    fn insert_bill(&self, ctx: &TenantContext, bill: Bill) -> Result<Bill, PaymentError> {
        self.partitions.write(ctx, |partition| {
            partition.bills.insert(bill.id, bill.clone());
            bill
        })
        .map_err(PaymentError::from)
    }

    fn update_bill(&self, ctx: &TenantContext, mut bill: Bill) -> Result<Bill, PaymentError> {
        self.partitions.write(ctx, |partition| {
            let stored = partition
                .bills
                .get_mut(&bill.id)
                .ok_or(PaymentError::BillNotFound(bill.id))?;
            if stored.version != bill.version {
                return Err(conflict("bill", bill.id));
            }
            bill.version += 1;
            *stored = bill.clone();
            Ok(bill)
        })?
    }

    fn bill(&self, ctx: &TenantContext, id: BillId) -> Result<Option<Bill>, PaymentError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition.bills.get(&id).filter(|bill| !bill.deleted).cloned()
        })?)
    }

    fn insert_transaction(&self, ctx: &TenantContext, txn: Transaction) -> Result<Transaction, PaymentError> {
        self.partitions.write(ctx, |partition| {
            if partition.idempotency.contains_key(&txn.idempotency_key) {
                return Err(PaymentError::DuplicateIdempotencyKey(txn.idempotency_key.clone()));
            }
            partition.idempotency.insert(txn.idempotency_key.clone(), txn.id);
            partition.transactions.insert(txn.id, txn.clone());
            Ok(txn)
        })?
    }

    fn update_transaction(&self, ctx: &TenantContext, mut txn: Transaction) -> Result<Transaction, PaymentError> {
        self.partitions.write(ctx, |partition| {
            let stored = partition
                .transactions
                .get_mut(&txn.id)
                .ok_or(PaymentError::TransactionNotFound(txn.id))?;
            if stored.version != txn.version {
                return Err(conflict("transaction", txn.id));
            }
            txn.version += 1;
            *stored = txn.clone();
            Ok(txn)
        })?
    }

    fn transaction(&self, ctx: &TenantContext, id: TransactionId) -> Result<Option<Transaction>, PaymentError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.transactions.get(&id).cloned())?)
    }

    fn transaction_by_key(&self, ctx: &TenantContext, key: &str) -> Result<Option<Transaction>, PaymentError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .idempotency
                .get(key)
                .and_then(|id| partition.transactions.get(id))
                .cloned()
        })?)
    }

    fn transactions_for_bill(&self, ctx: &TenantContext, bill: BillId) -> Result<Vec<Transaction>, PaymentError> {
        let mut rows = self.partitions.read(ctx, |partition| {
            partition
                .transactions
                .values()
                .filter(|txn| txn.bill_id == bill)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(rows)
    }

    fn refunds_for_request(
        &self,
        ctx: &TenantContext,
        request: RefundRequestId,
    ) -> Result<Vec<Transaction>, PaymentError> {
        let mut rows = self.partitions.read(ctx, |partition| {
            partition
                .transactions
                .values()
                .filter(|txn| txn.kind == TransactionKind::Refund && txn.refund_request == Some(request))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(rows)
    }

    fn reconciliation_candidates(
        &self,
        ctx: &TenantContext,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, PaymentError> {
        let mut rows = self.partitions.read(ctx, |partition| {
            partition
                .transactions
                .values()
                .filter(|txn| {
                    let awaiting_gateway = txn.kind == TransactionKind::Refund
                        && txn.status == TransactionStatus::Pending
                        && txn.gateway_response.is_some();
                    let tracked = txn.gateway_txn_id.is_some()
                        && !matches!(txn.status, TransactionStatus::Failed | TransactionStatus::Cancelled)
                        && (txn.status == TransactionStatus::Pending
                            || txn.last_recon_at.map_or(true, |at| at < cutoff));
                    awaiting_gateway || tracked
                })
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by_key(|txn| txn.created_at);
        Ok(rows)
    }

    fn insert_refund_request(
        &self,
        ctx: &TenantContext,
        request: BillRefundRequest,
    ) -> Result<BillRefundRequest, PaymentError> {
        Ok(self.partitions.write(ctx, |partition| {
            partition.refund_requests.insert(request.id, request.clone());
            request
        })?)
    }

    fn update_refund_request(
        &self,
        ctx: &TenantContext,
        mut request: BillRefundRequest,
    ) -> Result<BillRefundRequest, PaymentError> {
        self.partitions.write(ctx, |partition| {
            let stored = partition
                .refund_requests
                .get_mut(&request.id)
                .ok_or(PaymentError::RefundRequestNotFound(request.id))?;
            if stored.version != request.version {
                return Err(conflict("refund_request", request.id));
            }
            request.version += 1;
            *stored = request.clone();
            Ok(request)
        })?
    }

    fn refund_request(
        &self,
        ctx: &TenantContext,
        id: RefundRequestId,
    ) -> Result<Option<BillRefundRequest>, PaymentError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.refund_requests.get(&id).cloned())?)
    }

    fn refund_requests_for_bill(
        &self,
        ctx: &TenantContext,
        bill: BillId,
    ) -> Result<Vec<BillRefundRequest>, PaymentError> {
        let mut rows = self.partitions.read(ctx, |partition| {
            partition
                .refund_requests
                .values()
                .filter(|request| request.bill_id == bill)
                .cloned()
                .collect::<Vec<_>>()
        })?;
        rows.sort_by_key(|request| request.created_at);
        Ok(rows)
    }

    fn credit_wallet(
        &self,
        ctx: &TenantContext,
        resident: ResidentId,
        reference: TransactionId,
        amount: i64,
        currency: &str,
        at: DateTime<Utc>,
    ) -> Result<Wallet, PaymentError> {
        Ok(self.partitions.write(ctx, |partition| {
            let fresh = partition.wallet_credits.insert(reference);
            let wallet = partition.wallets.entry(resident).or_insert_with(|| Wallet {
                resident_id: resident,
                balance: 0,
                currency: currency.to_string(),
                updated_at: at,
            });
            if fresh {
                wallet.balance += amount;
                wallet.updated_at = at;
            }
            wallet.clone()
        })?)
    }

    fn wallet(&self, ctx: &TenantContext, resident: ResidentId) -> Result<Option<Wallet>, PaymentError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.wallets.get(&resident).cloned())?)
    }

    fn append_ledger(&self, ctx: &TenantContext, entry: LedgerEntry) -> Result<(), PaymentError> {
        Ok(self.partitions.write(ctx, |partition| {
            if !partition
                .ledger
                .iter()
                .any(|existing| existing.transaction_id == entry.transaction_id)
            {
                partition.ledger.push(entry);
            }
        })?)
    }

    fn ledger_for_bill(&self, ctx: &TenantContext, bill: BillId) -> Result<Vec<LedgerEntry>, PaymentError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .ledger
                .iter()
                .filter(|entry| entry.bill_id == bill)
                .cloned()
                .collect()
        })?)
    }

    fn append_log(&self, ctx: &TenantContext, entry: TransactionLogEntry) -> Result<(), PaymentError> {
        Ok(self.partitions.write(ctx, |partition| partition.logs.push(entry))?)
    }

    fn logs_for(&self, ctx: &TenantContext, txn: TransactionId) -> Result<Vec<TransactionLogEntry>, PaymentError> {
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .logs
                .iter()
                .filter(|entry| entry.transaction_id == txn)
                .cloned()
                .collect()
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::payments::domain::LedgerKind;
    use crate::tenancy::{NewTenant, TenantDirectory, TenantState};
    use uuid::Uuid;

    fn tenant() -> TenantContext {
        let directory = TenantDirectory::new("admin.resido.test", clock::system());
        let tenant = directory
            .provision(NewTenant {
                schema: "birch".into(),
                domain: "birch.resido.test".into(),
                name: "Birch".into(),
                state: TenantState::Active,
            })
            .expect("tenant provisions");
        directory.bind(tenant).context().clone()
    }

    #[test]
    fn wallet_credits_apply_once_per_reference() {
        let repository = InMemoryPaymentRepository::new();
        let ctx = tenant();
        let resident = ResidentId::new();
        let refund = TransactionId::new();
        let now = Utc::now();

        repository.credit_wallet(&ctx, resident, refund, 250, "USD", now).expect("credit");
        let again = repository.credit_wallet(&ctx, resident, refund, 250, "USD", now).expect("repeat");
        assert_eq!(again.balance, 250);

        let other = repository
            .credit_wallet(&ctx, resident, TransactionId::new(), 100, "USD", now)
            .expect("second refund");
        assert_eq!(other.balance, 350);
    }

    #[test]
    fn ledger_keeps_one_entry_per_transaction() {
        let repository = InMemoryPaymentRepository::new();
        let ctx = tenant();
        let bill = BillId::new();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            kind: LedgerKind::WriteOff,
            bill_id: bill,
            transaction_id: TransactionId::new(),
            amount: 40,
            currency: "USD".into(),
            recorded_at: Utc::now(),
        };

        repository.append_ledger(&ctx, entry.clone()).expect("append");
        repository
            .append_ledger(&ctx, LedgerEntry { id: Uuid::new_v4(), ..entry })
            .expect("repeat");
        assert_eq!(repository.ledger_for_bill(&ctx, bill).expect("ledger").len(), 1);
    }
}
