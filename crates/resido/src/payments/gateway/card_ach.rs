use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GatewayConfig;

use super::{
    to_major_units, AccountDetails, CardDetails, GatewayCharge, GatewayError, GatewayResult,
    GatewayStatus, InstallmentTerms, PaymentGateway, PosSession, QueryKind, RefundCall,
    RefundDisposition, RefundResult,
};
use crate::payments::domain::{RefundMethodology, TransactionMethod};

const AUTHENTICATE: &str = "/APIcardProcREST/v1.0.0/Authenticate";
const CARD_SALE: &str = "/APIcardProcREST/v1.0.0/CardSale/Manual";
const CARD_SALE_RECURRING: &str = "/APIcardProcREST/v1.0.0/ConsentRecurring/Create";
const ACH_SALE: &str = "/APIcardProcREST/v1.0.0/ACH/Sale";
const QUERY_CARD: &str = "/APIcardProcREST/v1.0.0/Query/Transaction";
const QUERY_ACH: &str = "/APIcardProcREST/v1.0.0/Query/ACHTransaction";
const APPLY_CREDIT: &str = "/APIcardProcREST/v1.0.0/CardSale/ApplyCredit";
const VOID_CARD: &str = "/APIcardProcREST/v1.0.0/CardSale/Void";
const VOID_ACH: &str = "/APIcardProcREST/v1.0.0/ACH/Void";

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const SESSION_HEADER: &str = "SessKey";

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    #[serde(rename = "AuthenticateResult")]
    result: AuthenticateResult,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResult {
    #[serde(rename = "SessKey")]
    session_key: String,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(rename = "ErrMsg", default)]
    error_message: String,
    #[serde(rename = "Transactions", default)]
    transactions: Vec<QueriedTransaction>,
}

#[derive(Debug, Deserialize)]
struct QueriedTransaction {
    #[serde(rename = "TxSTATUS")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ProcessingResult {
    #[serde(rename = "TxApproved", default)]
    approved: bool,
    #[serde(rename = "TxID", default)]
    txn_id: Option<Value>,
    #[serde(rename = "ErrMsg", default)]
    error_message: String,
}

/// Card and ACH processor reached over HTTPS. Every call authenticates
/// first and forwards the transaction's idempotency key on writes.
pub struct CardAchGateway {
    client: reqwest::Client,
    base_url: String,
    account_code: String,
    account_token: String,
}

impl CardAchGateway {
    /// Returns `Ok(None)` when no base URL is configured.
    pub fn from_config(config: &GatewayConfig) -> Result<Option<Self>, GatewayError> {
        let Some(base_url) = config.base_url.clone() else {
            return Ok(None);
        };
        Self::new(
            base_url,
            config.account_code.clone().unwrap_or_default(),
            config.account_token.clone().unwrap_or_default(),
            config.timeout,
        )
        .map(Some)
    }

    pub fn new(
        base_url: String,
        account_code: String,
        account_token: String,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("resido-payments")
            .build()
            .map_err(|e| GatewayError::NotConfigured(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_code,
            account_token,
        })
    }

    async fn authenticate(&self) -> Result<String, GatewayError> {
        let body = json!({ "AcctCode": self.account_code, "Token": self.account_token });
        let response: AuthenticateResponse = self.post(AUTHENTICATE, None, None, &body).await.and_then(decode)?;
        Ok(response.result.session_key)
    }

    async fn post(
        &self,
        path: &str,
        session: Option<&str>,
        idempotency_key: Option<&str>,
        body: &Value,
    ) -> Result<Value, GatewayError> {
        let mut request = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Unavailable(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Unavailable(format!("{path} returned {status}")));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;
        if status.is_client_error() {
            return Err(GatewayError::Rejected(format!("{path} returned {status}: {payload}")));
        }
        tracing::debug!(path, %status, "gateway call completed");
        Ok(payload)
    }

    async fn sale(&self, path: &str, result_key: &str, charge: &GatewayCharge, body: Value) -> Result<GatewayResult, GatewayError> {
        let session = self.authenticate().await?;
        let response = self
            .post(path, Some(&session), Some(&charge.idempotency_key), &body)
            .await?;
        let result: ProcessingResult = extract(&response, result_key)?;
        let gateway_txn_id = result.txn_id.as_ref().map(txn_id_string);
        let gateway_status = if result.approved {
            GatewayStatus::Open
        } else {
            GatewayStatus::Failed
        };
        if !result.approved {
            tracing::info!(error = %result.error_message, "gateway declined sale");
        }
        Ok(GatewayResult {
            approved: result.approved,
            gateway_txn_id,
            gateway_status,
            response,
        })
    }

    async fn void(&self, call: &RefundCall, session: &str) -> Result<RefundResult, GatewayError> {
        let (path, key) = match call.parent_method {
            TransactionMethod::OnlineAch => (VOID_ACH, "ACHTransaction_VoidResult"),
            _ => (VOID_CARD, "Transaction_VoidResult"),
        };
        let body = json!({ "TxID": call.parent_gateway_txn_id });
        let response = self
            .post(path, Some(session), Some(&call.charge.idempotency_key), &body)
            .await?;
        let result: ProcessingResult = extract(&response, key)?;
        Ok(RefundResult {
            disposition: if result.approved {
                RefundDisposition::Approved
            } else {
                RefundDisposition::Declined
            },
            methodology: Some(RefundMethodology::Void),
            gateway_txn_id: None,
            response,
        })
    }

    async fn credit(&self, call: &RefundCall, session: &str) -> Result<RefundResult, GatewayError> {
        let body = json!({
            "TxID": call.parent_gateway_txn_id,
            "CreditAmount": to_major_units(call.charge.amount),
        });
        let response = self
            .post(APPLY_CREDIT, Some(session), Some(&call.charge.idempotency_key), &body)
            .await?;
        let result: ProcessingResult = extract(&response, "Transaction_ApplyCreditResult")?;
        Ok(RefundResult {
            disposition: if result.approved {
                RefundDisposition::Approved
            } else {
                RefundDisposition::Declined
            },
            methodology: Some(RefundMethodology::Credit),
            gateway_txn_id: result.txn_id.as_ref().map(txn_id_string),
            response,
        })
    }

    async fn query_with_session(
        &self,
        session: &str,
        gateway_txn_id: &str,
        kind: QueryKind,
    ) -> Result<GatewayStatus, GatewayError> {
        let (path, key) = match kind {
            QueryKind::Card => (QUERY_CARD, "Transaction_QueryResult"),
            QueryKind::Ach => (QUERY_ACH, "ACHTransaction_QueryResult"),
        };
        let body = json!({ "Query": format!("(H={gateway_txn_id})") });
        let response = self.post(path, Some(session), None, &body).await?;
        let result: QueryResult = extract(&response, key)?;
        if !result.error_message.is_empty() {
            return Err(GatewayError::Rejected(result.error_message));
        }
        result
            .transactions
            .first()
            .map(|txn| GatewayStatus::parse(&txn.status))
            .ok_or_else(|| GatewayError::Rejected(format!("no transaction found for {gateway_txn_id}")))
    }
}

#[async_trait]
impl PaymentGateway for CardAchGateway {
    fn name(&self) -> &'static str {
        "card_ach"
    }

    async fn process_card_payment(
        &self,
        charge: &GatewayCharge,
        card: &CardDetails,
        cvv: &str,
        installments: Option<&InstallmentTerms>,
    ) -> Result<GatewayResult, GatewayError> {
        let mut body = json!({
            "ccCardInfo": {
                "Token": card.token,
                "ExpMonth": card.expiry_month,
                "ExpYear": card.expiry_year,
                "CSV": cvv,
            },
            "AcctHolder": { "Firstname": card.holder_name },
            "Amounts": { "TotalAmt": to_major_units(charge.amount) },
            "PurchItems": { "ServiceDescrip": "Resident bill", "ClientRefID": charge.idempotency_key },
        });
        match installments.filter(|terms| terms.count > 0) {
            Some(terms) => {
                body["ConsentCreator"] = json!({
                    "NumPayments": terms.count,
                    "StartDate": terms.first_date.to_string(),
                });
                self.sale(CARD_SALE_RECURRING, "ConsentRecurring_CreateResult", charge, body)
                    .await
            }
            None => {
                self.sale(CARD_SALE, "CreditCardSale_ManualResult", charge, body)
                    .await
            }
        }
    }

    async fn process_account_payment(
        &self,
        charge: &GatewayCharge,
        account: &AccountDetails,
    ) -> Result<GatewayResult, GatewayError> {
        let body = json!({
            "AchInfo": {
                "AccountToken": account.account_token,
                "RoutingNumber": account.routing_number,
            },
            "AcctHolder": { "Firstname": account.holder_name },
            "Amounts": { "TotalAmt": to_major_units(charge.amount) },
            "PurchItems": { "ServiceDescrip": "Resident bill", "ClientRefID": charge.idempotency_key },
        });
        self.sale(ACH_SALE, "ACHTransaction_SaleResult", charge, body).await
    }

    async fn prepare_pos_payment(&self, _charge: &GatewayCharge) -> Result<PosSession, GatewayError> {
        Err(GatewayError::Unsupported {
            gateway: "card_ach",
            operation: "prepare_pos_payment",
        })
    }

    async fn refund(&self, call: &RefundCall) -> Result<RefundResult, GatewayError> {
        let session = self.authenticate().await?;
        let kind = QueryKind::for_method(call.parent_method);
        let status = self
            .query_with_session(&session, &call.parent_gateway_txn_id, kind)
            .await?;

        match status.refund_methodology() {
            Some(RefundMethodology::Void) => self.void(call, &session).await,
            Some(RefundMethodology::Credit) => self.credit(call, &session).await,
            _ if status == GatewayStatus::Failed => {
                Ok(RefundResult::declined(json!({ "error": "txn_failed_at_gateway" })))
            }
            _ => Ok(RefundResult::declined(json!({
                "error": "refund_not_possible",
                "gateway_status": status.as_str(),
            }))),
        }
    }

    async fn query_transaction(&self, gateway_txn_id: &str, kind: QueryKind) -> Result<GatewayStatus, GatewayError> {
        let session = self.authenticate().await?;
        self.query_with_session(&session, gateway_txn_id, kind).await
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|err| GatewayError::Malformed(err.to_string()))
}

fn extract<T: for<'de> Deserialize<'de>>(response: &Value, key: &str) -> Result<T, GatewayError> {
    let section = response
        .get(key)
        .cloned()
        .ok_or_else(|| GatewayError::Malformed(format!("missing {key}")))?;
    decode(section)
}

fn txn_id_string(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}
