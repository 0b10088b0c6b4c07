//! Engine fixture shared by the integration tests: one provisioned tenant on
//! a manual clock, a scripted card processor and a recording mail transport.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use resido::access::AccessScope;
use resido::auth::{NewResident, NewStaff, RequestContext, ResidentAccount, StaffAccount, SubTokenType, TokenSubject};
use resido::clock::ManualClock;
use resido::features::{codes, ModulePermission};
use resido::ids::{LeaseId, RequestId, UnitId};
use resido::notifications::RecordingTransport;
use resido::payments::{Bill, NewBill, NewPayment, SimulatedGateway, Transaction, TransactionMethod, TransactionStatus};
use resido::tenancy::{NewTenant, Tenant, TenantContext, TenantState};
use resido::{Engine, EngineParts};
use serde_json::Value;
use tower::ServiceExt;

pub(crate) const CURRENCY: &str = "USD";
pub(crate) const OPERATOR_ROLE: &str = "operator";
pub(crate) const PASSWORD: &str = "correct horse battery staple";

pub(crate) struct Harness {
    pub engine: Engine,
    pub clock: ManualClock,
    pub gateway: Arc<SimulatedGateway>,
    pub transport: Arc<RecordingTransport>,
    pub tenant: Arc<Tenant>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::build(|parts| parts)
    }

    /// Refund calls slower than `deadline` come back Pending.
    pub(crate) fn with_gateway_deadline(deadline: std::time::Duration) -> Self {
        Self::build(|parts| parts.with_gateway_timeout(deadline))
    }

    fn build(configure: impl FnOnce(EngineParts) -> EngineParts) -> Self {
        let clock = ManualClock::default();
        let gateway = Arc::new(SimulatedGateway::new());
        let transport = Arc::new(RecordingTransport::new());
        let parts = configure(EngineParts::in_memory(Arc::new(clock.clone())))
            .with_card_gateway(gateway.clone())
            .with_transport(transport.clone())
            .with_public_domain("admin.resido.test");
        let engine = Engine::new(parts).expect("engine assembles");
        let tenant = provision(&engine, "acme");
        Self {
            engine,
            clock,
            gateway,
            transport,
            tenant,
        }
    }

    pub(crate) fn provision(&self, schema: &str) -> Arc<Tenant> {
        provision(&self.engine, schema)
    }

    pub(crate) fn ctx(&self) -> TenantContext {
        self.engine.tenant_context(self.tenant.clone())
    }

    /// Engine-internal caller with unrestricted row access.
    pub(crate) fn system(&self) -> RequestContext {
        RequestContext::system(self.ctx(), RequestId::new())
    }

    pub(crate) fn resident(&self, email: &str) -> ResidentAccount {
        self.engine
            .users
            .add_resident(
                &self.ctx(),
                NewResident {
                    email: email.to_string(),
                    password: None,
                    unit: UnitId::new(),
                    leases: vec![LeaseId::new()],
                },
            )
            .expect("resident")
    }

    pub(crate) fn bill(&self, resident: &ResidentAccount, amount: i64) -> Bill {
        self.engine
            .payments
            .create_bill(
                &self.system(),
                NewBill {
                    resident_id: resident.id,
                    location: Default::default(),
                    amount,
                    currency: CURRENCY.to_string(),
                    display_id: None,
                },
            )
            .expect("bill")
    }

    pub(crate) fn payment(&self, bill: &Bill, method: TransactionMethod, amount: i64, gateway_txn_id: Option<&str>) -> Transaction {
        self.payment_with_status(bill, method, amount, gateway_txn_id, TransactionStatus::Completed)
    }

    pub(crate) fn payment_with_status(
        &self,
        bill: &Bill,
        method: TransactionMethod,
        amount: i64,
        gateway_txn_id: Option<&str>,
        status: TransactionStatus,
    ) -> Transaction {
        self.engine
            .payments
            .record_payment(
                &self.system(),
                bill.id,
                NewPayment {
                    method,
                    amount,
                    currency: CURRENCY.to_string(),
                    gateway_txn_id: gateway_txn_id.map(str::to_string),
                    gateway_status: None,
                    status,
                    idempotency_key: None,
                },
            )
            .expect("payment")
    }

    /// Moves past the dispatcher countdown and runs everything that is due.
    pub(crate) async fn run_tasks(&self) -> usize {
        self.clock.advance(chrono::Duration::seconds(5));
        self.engine.run_due_tasks().await
    }

    /// Staff member holding full rights on every gated module.
    pub(crate) fn operator(&self, email: &str) -> StaffAccount {
        let ctx = self.ctx();
        let staff = self
            .engine
            .users
            .add_staff(
                &ctx,
                NewStaff {
                    email: email.to_string(),
                    password: Some(PASSWORD.to_string()),
                    roles: BTreeSet::from([OPERATOR_ROLE.to_string()]),
                    scope: AccessScope::admin(),
                    customer_admin_of: None,
                },
            )
            .expect("staff");
        for code in [codes::PAYMENTS, codes::BILLING, codes::PROCESSES] {
            self.engine
                .permissions
                .grant_module(&ctx, ModulePermission::full(OPERATOR_ROLE, code))
                .expect("grant");
        }
        staff
    }

    pub(crate) fn token_for(&self, tenant: &Tenant, staff: &StaffAccount) -> String {
        self.engine
            .authenticator
            .issuer()
            .issue(tenant, TokenSubject::User(staff.id), SubTokenType::FullAccess)
            .expect("token")
            .access_token
    }

    pub(crate) fn operator_token(&self) -> String {
        let staff = self.operator("ops@acme.test");
        self.token_for(&self.tenant, &staff)
    }

    pub(crate) async fn call(&self, method: Method, uri: &str, host: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri).header(header::HOST, host);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");

        let response = self.engine.router().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }
}

fn provision(engine: &Engine, schema: &str) -> Arc<Tenant> {
    engine
        .provision_tenant(NewTenant {
            schema: schema.to_string(),
            domain: domain(schema),
            name: schema.to_string(),
            state: TenantState::Active,
        })
        .expect("tenant")
}

pub(crate) fn domain(schema: &str) -> String {
    format!("{schema}.resido.test")
}
