use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    AccountDetails, CardDetails, GatewayCharge, GatewayError, GatewayResult, GatewayStatus,
    InstallmentTerms, PaymentGateway, PosSession, QueryKind, RefundCall, RefundDisposition,
    RefundResult,
};

const TIMEOUT_STATUS: &str = "TIMEOUT";

/// Bounds every gateway call. A call that runs past the deadline has an
/// unknown outcome: sales come back unapproved with an unknown status,
/// refunds come back Pending, and reconciliation settles them later.
pub struct DeadlineGateway {
    inner: Arc<dyn PaymentGateway>,
    deadline: Duration,
}

impl DeadlineGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Option<Result<T, GatewayError>> {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::warn!(
                    gateway = self.inner.name(),
                    operation,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "gateway call exceeded its deadline"
                );
                None
            }
        }
    }

    fn timed_out_sale() -> GatewayResult {
        GatewayResult {
            approved: false,
            gateway_txn_id: None,
            gateway_status: GatewayStatus::Unknown(TIMEOUT_STATUS.to_string()),
            response: json!({ "error": "gateway_timeout" }),
        }
    }
}

#[async_trait]
impl PaymentGateway for DeadlineGateway {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn process_card_payment(
        &self,
        charge: &GatewayCharge,
        card: &CardDetails,
        cvv: &str,
        installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError> {
        self.bounded(
            "process_card_payment",
            self.inner.process_card_payment(charge, card, cvv, installments),
        )
        .await
        .unwrap_or_else(|| Ok(Self::timed_out_sale()))
    }

    async fn process_account_payment(
        &self,
        charge: &GatewayCharge,
        account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError> {
        self.bounded(
            "process_account_payment",
            self.inner.process_account_payment(charge, account),
        )
        .await
        .unwrap_or_else(|| Ok(Self::timed_out_sale()))
    }

    async fn prepare_pos_payment(&self, charge: &GatewayCharge) -> Result<PosSession, GatewayError> {
        self.bounded("prepare_pos_payment", self.inner.prepare_pos_payment(charge))
            .await
            .unwrap_or_else(|| Err(GatewayError::Unavailable("terminal session timed out".to_string())))
    }

    async fn refund(&self, call: &RefundCall) -> Result<RefundResult, GatewayError> {
        self.bounded("refund", self.inner.refund(call))
            .await
            .unwrap_or_else(|| {
                Ok(RefundResult {
                    disposition: RefundDisposition::Pending,
                    methodology: None,
                    gateway_txn_id: None,
                    response: json!({ "error": "gateway_timeout" }),
                })
            })
    }

    async fn query_transaction(&self, gateway_txn_id: &str, kind: QueryKind) -> Result<GatewayStatus, GatewayError> {
        self.bounded("query_transaction", self.inner.query_transaction(gateway_txn_id, kind))
            .await
            .unwrap_or_else(|| Ok(GatewayStatus::Unknown(TIMEOUT_STATUS.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::domain::TransactionMethod;
    use crate::payments::gateway::SimulatedGateway;

    fn slow_gateway() -> (Arc<SimulatedGateway>, DeadlineGateway) {
        let inner = Arc::new(SimulatedGateway::new());
        inner.set_status("SIM-9", GatewayStatus::Settled);
        inner.set_latency(Some(Duration::from_millis(200)));
        let gateway = DeadlineGateway::new(inner.clone(), Duration::from_millis(20));
        (inner, gateway)
    }

    #[tokio::test]
    async fn refund_past_deadline_is_pending() {
        let (_, gateway) = slow_gateway();
        let call = RefundCall {
            parent_gateway_txn_id: "SIM-9".to_string(),
            parent_method: TransactionMethod::OnlineCard,
            charge: GatewayCharge {
                idempotency_key: "r:0".to_string(),
                amount: 100,
                currency: "USD".to_string(),
            },
        };
        let result = gateway.refund(&call).await.expect("timeout is not an error");
        assert_eq!(result.disposition, RefundDisposition::Pending);
    }

    #[tokio::test]
    async fn query_past_deadline_reports_unknown_status() {
        let (_, gateway) = slow_gateway();
        let status = gateway
            .query_transaction("SIM-9", QueryKind::Card)
            .await
            .expect("timeout is not an error");
        assert!(!status.is_known());
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let (inner, gateway) = slow_gateway();
        inner.set_latency(None);
        let status = gateway
            .query_transaction("SIM-9", QueryKind::Card)
            .await
            .expect("status");
        assert_eq!(status, GatewayStatus::Settled);
    }
}
