use clap::Args;
use resido::api::ApiError;
use resido::auth::{NewResident, RequestContext};
use resido::clock::ManualClock;
use resido::error::AppError;
use resido::ids::{LeaseId, RequestId, UnitId};
use resido::notifications::RecordingTransport;
use resido::payments::{
    GatewayStatus, NewBill, NewPayment, NewRefundLine, NewRefundRequest, RefundType,
    SimulatedGateway, TransactionMethod, TransactionStatus,
};
use resido::tenancy::{NewTenant, TenantContext, TenantState};
use resido::{Engine, EngineParts};
use std::sync::Arc;

const DEMO_CURRENCY: &str = "USD";

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Bill amount in minor units
    #[arg(long, default_value_t = 12_000)]
    pub(crate) amount: i64,
    /// Simulate a card processor outage so the refund fails
    #[arg(long)]
    pub(crate) gateway_outage: bool,
}

/// Walks one bill through payment, a back-to-source refund on the worker
/// pool, the resident notification and a reconciliation run.
pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let clock = ManualClock::default();
    let gateway = Arc::new(SimulatedGateway::new());
    let transport = Arc::new(RecordingTransport::new());
    let engine = Engine::new(
        EngineParts::in_memory(Arc::new(clock.clone()))
            .with_card_gateway(gateway.clone())
            .with_transport(transport.clone()),
    )?;
    let tenant = engine.provision_tenant(NewTenant {
        schema: "demo".to_string(),
        domain: "demo.resido.local".to_string(),
        name: "Demo Properties".to_string(),
        state: TenantState::Active,
    })?;
    let tenant_ctx = engine.tenant_context(tenant);

    println!("Resido refund walkthrough");
    println!("  Tenant: {} (plan {})", tenant_ctx.schema(), engine.default_plan());

    gateway.set_outage(args.gateway_outage);
    if let Err(err) = walkthrough(&engine, &tenant_ctx, &clock, &gateway, args.amount).await {
        println!("  Demo stopped: {err}");
        return Ok(());
    }

    println!("  Notifications delivered: {}", transport.sent().len());
    let audited = engine
        .audit
        .entries(&tenant_ctx)
        .map(|entries| entries.len())
        .unwrap_or(0);
    println!("  Audit entries: {audited}");
    Ok(())
}

async fn walkthrough(
    engine: &Engine,
    tenant_ctx: &TenantContext,
    clock: &ManualClock,
    gateway: &SimulatedGateway,
    amount: i64,
) -> Result<(), ApiError> {
    let ctx = RequestContext::system(tenant_ctx.clone(), RequestId::new());

    let resident = engine.users.add_resident(
        tenant_ctx,
        NewResident {
            email: "resident@demo.resido.local".to_string(),
            password: None,
            unit: UnitId::new(),
            leases: vec![LeaseId::new()],
        },
    )?;

    let bill = engine.payments.create_bill(
        &ctx,
        NewBill {
            resident_id: resident.id,
            location: Default::default(),
            amount,
            currency: DEMO_CURRENCY.to_string(),
            display_id: None,
        },
    )?;
    gateway.set_status("TX-DEMO-1", GatewayStatus::Settled);
    let payment = engine.payments.record_payment(
        &ctx,
        bill.id,
        NewPayment {
            method: TransactionMethod::OnlineCard,
            amount,
            currency: DEMO_CURRENCY.to_string(),
            gateway_txn_id: Some("TX-DEMO-1".to_string()),
            gateway_status: Some("SETTLED".to_string()),
            status: TransactionStatus::Completed,
            idempotency_key: None,
        },
    )?;
    let bill = engine.payments.bill(&ctx, bill.id)?;
    println!("  Bill {}: {:?}, paid {}", bill.display_id, bill.status, format_money(bill.paid_amount));

    let submission = engine
        .refund_requests
        .create(
            &ctx,
            bill.id,
            NewRefundRequest {
                refund_type: RefundType::Full,
                lines: vec![NewRefundLine {
                    parent: payment.id,
                    amount,
                    method: TransactionMethod::BackToSource,
                }],
                reason: Some("Lease cancelled before move-in".to_string()),
            },
        )
        .await?;
    println!(
        "  Refund request {} queued as process {}",
        submission.refund_request.display_id, submission.process_id
    );

    clock.advance(chrono::Duration::seconds(5));
    let handled = engine.run_due_tasks().await;
    println!("  Worker handled {handled} task(s)");

    let process = engine.registry.detail(&ctx, submission.process_id)?;
    let detail = engine.refund_requests.get(&ctx, submission.refund_request.id)?;
    println!(
        "  Process {:?}; refund request {:?}, processed {}",
        process.status,
        detail.refund_request.status,
        format_money(detail.refund_request.total_refund_processed)
    );
    for refund in &detail.refunds {
        match &refund.error_body {
            Some(body) => println!("    refund {} {:?}: {}", refund.id, refund.status, body),
            None => println!("    refund {} {:?} via {:?}", refund.id, refund.status, refund.methodology),
        }
    }
    let bill = engine.payments.bill(&ctx, bill.id)?;
    println!("  Bill now {:?}, refundable {}", bill.status, format_money(bill.refundable_amount));

    let drained = engine.notifications.drain(tenant_ctx).await?;
    println!("  Notification drain: {} sent, {} deferred", drained.sent, drained.deferred);

    let report = engine.reconciler.reconcile(tenant_ctx, RequestId::new()).await?;
    println!(
        "  Reconciliation: {} examined, {} updated, {} unchanged",
        report.examined, report.updated, report.unchanged
    );
    Ok(())
}

fn format_money(minor: i64) -> String {
    format!("{}.{:02} {DEMO_CURRENCY}", minor / 100, (minor % 100).abs())
}
