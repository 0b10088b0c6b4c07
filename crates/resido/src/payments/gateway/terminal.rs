use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::{
    to_major_units, AccountDetails, CardDetails, GatewayCharge, GatewayError, GatewayResult,
    GatewayStatus, InstallmentTerms, PaymentGateway, PosSession, QueryKind, RefundCall,
    RefundResult,
};

/// Point-of-sale terminal. Payments are started on the device, so this
/// adapter only hands out a session; refunds and lookups go through the
/// processor that settles terminal payments.
pub struct TerminalGateway {
    settlement: Arc<dyn PaymentGateway>,
}

impl TerminalGateway {
    pub fn new(settlement: Arc<dyn PaymentGateway>) -> Self {
        Self { settlement }
    }
}

#[async_trait]
impl PaymentGateway for TerminalGateway {
    fn name(&self) -> &'static str {
        "pos_terminal"
    }

    async fn process_card_payment(
        &self,
        _charge: &GatewayCharge,
        _card: &CardDetails,
        _cvv: &str,
        _installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError> {
        Err(GatewayError::Unsupported {
            gateway: "pos_terminal",
            operation: "process_card_payment",
        })
    }

    async fn process_account_payment(
        &self,
        _charge: &GatewayCharge,
        _account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError> {
        Err(GatewayError::Unsupported {
            gateway: "pos_terminal",
            operation: "process_account_payment",
        })
    }

    async fn prepare_pos_payment(&self, charge: &GatewayCharge) -> Result<PosSession, GatewayError> {
        let reference = Uuid::new_v4().simple().to_string();
        Ok(PosSession {
            payload: json!({
                "reference": reference,
                "client_ref_id": charge.idempotency_key,
                "amount": to_major_units(charge.amount),
                "currency": charge.currency,
            }),
            reference,
        })
    }

    async fn refund(&self, call: &RefundCall) -> Result<RefundResult, GatewayError> {
        self.settlement.refund(call).await
    }

    async fn query_transaction(&self, gateway_txn_id: &str, kind: QueryKind) -> Result<GatewayStatus, GatewayError> {
        self.settlement.query_transaction(gateway_txn_id, kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::gateway::NullGateway;

    #[tokio::test]
    async fn sessions_carry_the_idempotency_key() {
        let gateway = TerminalGateway::new(Arc::new(NullGateway::default()));
        let charge = GatewayCharge {
            idempotency_key: "bill-7:0".to_string(),
            amount: 1250,
            currency: "USD".to_string(),
        };
        let session = gateway.prepare_pos_payment(&charge).await.expect("session");
        assert_eq!(session.payload["client_ref_id"], "bill-7:0");
        assert_eq!(session.payload["amount"], 12.5);
        assert_eq!(session.payload["reference"], session.reference.as_str());
    }
}
