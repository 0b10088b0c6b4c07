//! Reconciliation against the scripted processor: Pending payments and
//! refunds whose gateway call outlived its deadline.

mod common;

use std::time::Duration;

use common::Harness;
use resido::ids::RequestId;
use resido::payments::{
    BillStatus, GatewayStatus, NewRefundLine, NewRefundRequest, RefundMethodology, RefundRequestStatus,
    RefundType, TransactionEvent, TransactionMethod, TransactionStatus,
};

#[tokio::test]
async fn pending_payment_settled_at_the_gateway_completes_the_bill() {
    let harness = Harness::new();
    let resident = harness.resident("noa@example.test");
    let bill = harness.bill(&resident, 700);
    harness.gateway.set_status("TX-2", GatewayStatus::Settled);
    let payment = harness.payment_with_status(
        &bill,
        TransactionMethod::OnlineCard,
        700,
        Some("TX-2"),
        TransactionStatus::Pending,
    );
    let system = harness.system();
    assert_eq!(harness.engine.payments.bill(&system, bill.id).expect("bill").paid_amount, 0);

    let request_id = RequestId::new();
    let report = harness
        .engine
        .reconciler
        .reconcile(&harness.ctx(), request_id)
        .await
        .expect("report");
    assert_eq!(report.examined, 1);
    assert_eq!(report.updated, 1);
    assert!(report.errors.is_empty());

    let payment = harness.engine.payments.transaction(&system, payment.id).expect("payment");
    assert_eq!(payment.status, TransactionStatus::Completed);
    assert_eq!(payment.gateway_status.as_deref(), Some("SETTLED"));
    assert_eq!(payment.last_recon_request_id, Some(request_id));
    assert!(harness
        .engine
        .payments
        .logs(&system, payment.id)
        .expect("logs")
        .iter()
        .any(|entry| entry.event == TransactionEvent::ReconcileGateway));

    let bill = harness.engine.payments.bill(&system, bill.id).expect("bill");
    assert_eq!(bill.paid_amount, 700);
    assert_eq!(bill.status, BillStatus::Completed);
}

#[tokio::test]
async fn recently_reconciled_rows_are_left_alone() {
    let harness = Harness::new();
    let resident = harness.resident("eli@example.test");
    let bill = harness.bill(&resident, 300);
    harness.gateway.set_status("TX-5", GatewayStatus::Settled);
    harness.payment_with_status(&bill, TransactionMethod::OnlineCard, 300, Some("TX-5"), TransactionStatus::Pending);

    let first = harness.engine.reconciler.reconcile(&harness.ctx(), RequestId::new()).await.expect("first");
    assert_eq!(first.updated, 1);

    let second = harness.engine.reconciler.reconcile(&harness.ctx(), RequestId::new()).await.expect("second");
    assert_eq!(second.examined, 0);
}

#[tokio::test]
async fn timed_out_refund_is_resolved_through_its_voided_parent() {
    let harness = Harness::with_gateway_deadline(Duration::from_millis(20));
    let resident = harness.resident("ivy@example.test");
    let bill = harness.bill(&resident, 900);
    harness.gateway.set_status("TX-4", GatewayStatus::Open);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 900, Some("TX-4"));

    harness.gateway.set_latency(Some(Duration::from_millis(200)));
    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            NewRefundRequest {
                refund_type: RefundType::Full,
                lines: vec![NewRefundLine {
                    parent: payment.id,
                    amount: 900,
                    method: TransactionMethod::BackToSource,
                }],
                reason: None,
            },
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let id = submission.refund_request.id;
    let detail = harness.engine.refund_requests.get(&harness.system(), id).expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Pending);
    assert_eq!(detail.refunds[0].status, TransactionStatus::Pending);
    assert_eq!(
        harness.engine.payments.bill(&harness.system(), bill.id).expect("bill").status,
        BillStatus::RefundInitiated
    );

    // The processor voided the authorization after the call timed out.
    harness.gateway.set_latency(None);
    harness.gateway.set_status("TX-4", GatewayStatus::Void);
    harness
        .engine
        .reconciler
        .reconcile(&harness.ctx(), RequestId::new())
        .await
        .expect("report");

    let detail = harness.engine.refund_requests.get(&harness.system(), id).expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Completed);
    assert_eq!(detail.refunds[0].status, TransactionStatus::Completed);
    assert_eq!(detail.refunds[0].methodology, Some(RefundMethodology::Void));

    let parent = harness.engine.payments.transaction(&harness.system(), payment.id).expect("parent");
    assert_eq!(parent.refunded_amount, 900);
    assert_eq!(
        harness.engine.payments.bill(&harness.system(), bill.id).expect("bill").status,
        BillStatus::Refunded
    );
}

#[tokio::test]
async fn unconfirmed_refund_on_a_settled_parent_fails_after_the_window() {
    let harness = Harness::with_gateway_deadline(Duration::from_millis(20));
    let resident = harness.resident("oz@example.test");
    let bill = harness.bill(&resident, 600);
    harness.gateway.set_status("TX-7", GatewayStatus::Settled);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 600, Some("TX-7"));

    harness.gateway.set_latency(Some(Duration::from_millis(200)));
    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            NewRefundRequest {
                refund_type: RefundType::Full,
                lines: vec![NewRefundLine {
                    parent: payment.id,
                    amount: 600,
                    method: TransactionMethod::BackToSource,
                }],
                reason: None,
            },
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;
    harness.gateway.set_latency(None);

    let id = submission.refund_request.id;
    let refund_id = harness.engine.refund_requests.get(&harness.system(), id).expect("detail").refunds[0].id;
    let first = harness
        .engine
        .reconciler
        .reconcile(&harness.ctx(), RequestId::new())
        .await
        .expect("report");
    assert!(first.unresolved.contains(&refund_id));
    let detail = harness.engine.refund_requests.get(&harness.system(), id).expect("detail");
    assert_eq!(detail.refunds[0].status, TransactionStatus::Pending);

    harness.clock.advance(chrono::Duration::hours(25));
    let late = harness
        .engine
        .reconciler
        .reconcile(&harness.ctx(), RequestId::new())
        .await
        .expect("report");
    assert!(!late.unresolved.contains(&refund_id));

    let detail = harness.engine.refund_requests.get(&harness.system(), id).expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Failed);
    assert_eq!(detail.refunds[0].status, TransactionStatus::RefundFailed);
    let body = detail.refunds[0].error_body.as_ref().expect("error body");
    assert_eq!(body["errors"][0]["code"], "refund_unconfirmed");

    let parent = harness.engine.payments.transaction(&harness.system(), payment.id).expect("parent");
    assert_eq!(parent.refunded_amount, 0);
    let bill = harness.engine.payments.bill(&harness.system(), bill.id).expect("bill");
    assert_eq!(bill.status, BillStatus::RefundFailed);
    assert_eq!(bill.refundable_amount, 600);
}
