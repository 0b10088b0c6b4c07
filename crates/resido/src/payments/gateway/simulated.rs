use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    AccountDetails, CardDetails, GatewayCharge, GatewayError, GatewayResult, GatewayStatus,
    InstallmentTerms, PaymentGateway, PosSession, QueryKind, RefundCall, RefundDisposition,
    RefundResult,
};
use crate::payments::domain::RefundMethodology;

#[derive(Debug, Default)]
struct SimulatorState {
    next_id: u64,
    statuses: HashMap<String, GatewayStatus>,
    declined_refunds: HashSet<String>,
    refund_calls: Vec<RefundCall>,
    /// Approved refunds by idempotency key; a repeated key replays the result.
    approved_refunds: HashMap<String, RefundResult>,
    outage: bool,
    latency: Option<Duration>,
}

/// Scripted processor for development and tests. Sales are approved and
/// left OPEN; refunds follow the same settlement rules as the real
/// processor against whatever status the script holds.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    state: Mutex<SimulatorState>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimulatorState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_status(&self, gateway_txn_id: impl Into<String>, status: GatewayStatus) {
        self.with_state(|state| {
            state.statuses.insert(gateway_txn_id.into(), status);
        });
    }

    pub fn status_of(&self, gateway_txn_id: &str) -> Option<GatewayStatus> {
        self.with_state(|state| state.statuses.get(gateway_txn_id).cloned())
    }

    /// Refunds against this parent are declined by the processor.
    pub fn decline_refunds_for(&self, parent_gateway_txn_id: impl Into<String>) {
        self.with_state(|state| {
            state.declined_refunds.insert(parent_gateway_txn_id.into());
        });
    }

    pub fn set_outage(&self, outage: bool) {
        self.with_state(|state| state.outage = outage);
    }

    /// Delay applied before every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.with_state(|state| state.latency = latency);
    }

    pub fn refund_calls(&self) -> Vec<RefundCall> {
        self.with_state(|state| state.refund_calls.clone())
    }

    async fn enter(&self) -> Result<(), GatewayError> {
        let (outage, latency) = self.with_state(|state| (state.outage, state.latency));
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if outage {
            return Err(GatewayError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    fn sale(&self, charge: &GatewayCharge) -> GatewayResult {
        let gateway_txn_id = self.with_state(|state| {
            state.next_id += 1;
            let id = format!("SIM-{}", state.next_id);
            state.statuses.insert(id.clone(), GatewayStatus::Open);
            id
        });
        GatewayResult {
            approved: true,
            gateway_txn_id: Some(gateway_txn_id.clone()),
            gateway_status: GatewayStatus::Open,
            response: json!({
                "TxApproved": true,
                "TxID": gateway_txn_id,
                "ClientRefID": charge.idempotency_key,
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn process_card_payment(
        &self,
        charge: &GatewayCharge,
        _card: &CardDetails,
        _cvv: &str,
        _installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError> {
        self.enter().await?;
        Ok(self.sale(charge))
    }

    async fn process_account_payment(
        &self,
        charge: &GatewayCharge,
        _account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError> {
        self.enter().await?;
        Ok(self.sale(charge))
    }

    async fn prepare_pos_payment(&self, charge: &GatewayCharge) -> Result<PosSession, GatewayError> {
        self.enter().await?;
        Ok(PosSession {
            reference: charge.idempotency_key.clone(),
            payload: json!({ "client_ref_id": charge.idempotency_key }),
        })
    }

    async fn refund(&self, call: &RefundCall) -> Result<RefundResult, GatewayError> {
        self.enter().await?;
        Ok(self.with_state(|state| {
            state.refund_calls.push(call.clone());
            let key = &call.charge.idempotency_key;
            if let Some(result) = state.approved_refunds.get(key) {
                return result.clone();
            }
            let result = settle_refund(state, call);
            if result.disposition == RefundDisposition::Approved {
                state.approved_refunds.insert(key.clone(), result.clone());
            }
            result
        }))
    }

    async fn query_transaction(&self, gateway_txn_id: &str, _kind: QueryKind) -> Result<GatewayStatus, GatewayError> {
        self.enter().await?;
        self.status_of(gateway_txn_id)
            .ok_or_else(|| GatewayError::Rejected(format!("no transaction found for {gateway_txn_id}")))
    }
}

fn settle_refund(state: &mut SimulatorState, call: &RefundCall) -> RefundResult {
    let parent = &call.parent_gateway_txn_id;
    if state.declined_refunds.contains(parent) {
        return RefundResult::declined(json!({ "error": "declined_by_processor" }));
    }
    let status = state
        .statuses
        .get(parent)
        .cloned()
        .unwrap_or_else(|| GatewayStatus::Unknown("NOT_FOUND".to_string()));

    match status.refund_methodology() {
        Some(RefundMethodology::Void) => {
            state.statuses.insert(parent.clone(), GatewayStatus::Void);
            RefundResult {
                disposition: RefundDisposition::Approved,
                methodology: Some(RefundMethodology::Void),
                gateway_txn_id: None,
                response: json!({ "TxApproved": true, "TxID": parent }),
            }
        }
        Some(_) => {
            state.next_id += 1;
            let credit_id = format!("SIM-CR-{}", state.next_id);
            state.statuses.insert(credit_id.clone(), GatewayStatus::Settled);
            RefundResult {
                disposition: RefundDisposition::Approved,
                methodology: Some(RefundMethodology::Credit),
                gateway_txn_id: Some(credit_id.clone()),
                response: json!({ "TxApproved": true, "TxID": credit_id }),
            }
        }
        None if status == GatewayStatus::Failed => {
            RefundResult::declined(json!({ "error": "txn_failed_at_gateway" }))
        }
        None => RefundResult::declined(json!({
            "error": "refund_not_possible",
            "gateway_status": status.as_str(),
        })),
    }
}
