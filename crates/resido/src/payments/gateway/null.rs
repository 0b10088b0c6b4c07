use async_trait::async_trait;

use super::{
    AccountDetails, CardDetails, GatewayCharge, GatewayError, GatewayResult, GatewayStatus,
    InstallmentTerms, PaymentGateway, PosSession, QueryKind, RefundCall, RefundResult,
};

/// Stand-in for methods with no gateway configured. Every call fails with
/// [`GatewayError::NotConfigured`].
#[derive(Debug, Clone, Default)]
pub struct NullGateway {
    label: String,
}

impl NullGateway {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }

    fn missing(&self) -> GatewayError {
        GatewayError::NotConfigured(if self.label.is_empty() {
            "this payment method".to_string()
        } else {
            self.label.clone()
        })
    }
}

#[async_trait]
impl PaymentGateway for NullGateway {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn process_card_payment(
        &self,
        _charge: &GatewayCharge,
        _card: &CardDetails,
        _cvv: &str,
        _installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError> {
        Err(self.missing())
    }

    async fn process_account_payment(
        &self,
        _charge: &GatewayCharge,
        _account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError> {
        Err(self.missing())
    }

    async fn prepare_pos_payment(&self, _charge: &GatewayCharge) -> Result<PosSession, GatewayError> {
        Err(self.missing())
    }

    async fn refund(&self, _call: &RefundCall) -> Result<RefundResult, GatewayError> {
        Err(self.missing())
    }

    async fn query_transaction(&self, _gateway_txn_id: &str, _kind: QueryKind) -> Result<GatewayStatus, GatewayError> {
        Err(self.missing())
    }
}
