//! End-to-end refund requests: submission, the queued worker run, gateway
//! outcomes and the bill they leave behind.

mod common;

use common::Harness;
use resido::payments::{
    Bill, BillStatus, GatewayStatus, NewPayment, NewRefundLine, NewRefundRequest, PaymentError, RefundMethodology,
    RefundRequestStatus, RefundType, Transaction, TransactionKind, TransactionMethod, TransactionStatus,
};
use resido::process::{ProcessStatus, ProcessUpdate};

fn line(parent: &Transaction, amount: i64, method: TransactionMethod) -> NewRefundLine {
    NewRefundLine {
        parent: parent.id,
        amount,
        method,
    }
}

fn request(refund_type: RefundType, lines: Vec<NewRefundLine>) -> NewRefundRequest {
    NewRefundRequest {
        refund_type,
        lines,
        reason: Some("move-out settlement".to_string()),
    }
}

fn reload(harness: &Harness, bill: &Bill) -> Bill {
    harness.engine.payments.bill(&harness.system(), bill.id).expect("bill")
}

/// Completed payments minus completed refunds always equals the bill's
/// paid minus refunded columns.
fn assert_bill_balances(harness: &Harness, bill: &Bill) {
    let bill = reload(harness, bill);
    let transactions = harness
        .engine
        .payments
        .transactions(&harness.system(), bill.id)
        .expect("transactions");
    let paid: i64 = transactions
        .iter()
        .filter(|txn| txn.kind == TransactionKind::Payment && txn.status.is_captured())
        .map(|txn| txn.amount)
        .sum();
    let refunded: i64 = transactions
        .iter()
        .filter(|txn| txn.kind == TransactionKind::Refund && txn.status == TransactionStatus::Completed)
        .map(|txn| txn.amount)
        .sum();
    assert_eq!(paid - refunded, bill.paid_amount - bill.refunded_amount);
}

#[tokio::test]
async fn full_back_to_source_refund_settles_the_bill() {
    let harness = Harness::new();
    let resident = harness.resident("dana@example.test");
    let bill = harness.bill(&resident, 12_000);
    harness.gateway.set_status("TX-1", GatewayStatus::Settled);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 12_000, Some("TX-1"));
    assert_eq!(reload(&harness, &bill).status, BillStatus::Completed);

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Full, vec![line(&payment, 12_000, TransactionMethod::BackToSource)]),
        )
        .await
        .expect("accepted");
    assert_eq!(submission.refund_request.status, RefundRequestStatus::Pending);
    assert!(submission.task_id.is_some());

    assert_eq!(harness.run_tasks().await, 1);

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Completed);
    assert_eq!(detail.refund_request.total_refund_processed, 12_000);
    assert_eq!(detail.refunds.len(), 1);
    assert_eq!(detail.refunds[0].status, TransactionStatus::Completed);
    assert_eq!(detail.refunds[0].methodology, Some(RefundMethodology::Credit));

    let parent = harness
        .engine
        .payments
        .transaction(&harness.system(), payment.id)
        .expect("parent");
    assert_eq!(parent.refunded_amount, 12_000);
    assert_eq!(parent.status, TransactionStatus::Refunded);

    let bill = reload(&harness, &bill);
    assert_eq!(bill.status, BillStatus::Refunded);
    assert_eq!(bill.refundable_amount, 0);

    let process = harness
        .engine
        .registry
        .get(&harness.ctx(), submission.process_id)
        .expect("process");
    assert_eq!(process.status, ProcessStatus::Completed);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn partial_refund_across_card_and_cash() {
    let harness = Harness::new();
    let resident = harness.resident("lee@example.test");
    let bill = harness.bill(&resident, 300);
    harness.gateway.set_status("TX-P1", GatewayStatus::Settled);
    let card = harness.payment(&bill, TransactionMethod::OnlineCard, 200, Some("TX-P1"));
    let cash = harness.payment(&bill, TransactionMethod::Cash, 100, None);

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(
                RefundType::Partial,
                vec![
                    line(&card, 50, TransactionMethod::BackToSource),
                    line(&cash, 25, TransactionMethod::Cash),
                ],
            ),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Completed);
    assert_eq!(detail.refund_request.total_refund_processed, 75);
    assert!(detail.refunds.iter().all(|refund| refund.status == TransactionStatus::Completed));

    let bill = reload(&harness, &bill);
    assert_eq!(bill.status, BillStatus::PartiallyRefunded);
    assert_eq!(bill.refundable_amount, 225);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn declined_gateway_line_yields_partial_success() {
    let harness = Harness::new();
    let resident = harness.resident("kim@example.test");
    let bill = harness.bill(&resident, 300);
    harness.gateway.set_status("TX-P1", GatewayStatus::Settled);
    harness.gateway.decline_refunds_for("TX-P1");
    let card = harness.payment(&bill, TransactionMethod::OnlineCard, 200, Some("TX-P1"));
    let cash = harness.payment(&bill, TransactionMethod::Cash, 100, None);

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(
                RefundType::Partial,
                vec![
                    line(&card, 50, TransactionMethod::BackToSource),
                    line(&cash, 25, TransactionMethod::Cash),
                ],
            ),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::PartialSuccess);
    assert_eq!(detail.refund_request.total_refund_processed, 25);

    let by_parent = |parent: &Transaction| {
        detail
            .refunds
            .iter()
            .find(|refund| refund.parent == Some(parent.id))
            .expect("refund row")
            .clone()
    };
    let declined = by_parent(&card);
    assert_eq!(declined.status, TransactionStatus::RefundFailed);
    assert!(declined.error_body.is_some());
    assert_eq!(by_parent(&cash).status, TransactionStatus::Completed);

    let report = harness
        .engine
        .refunds
        .process(&harness.ctx(), submission.refund_request.id)
        .await
        .expect("report");
    assert_eq!((report.success_count, report.total_count), (1, 2));

    assert_eq!(reload(&harness, &bill).status, BillStatus::PartiallyRefunded);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn gateway_outage_fails_the_request_and_replays_are_no_ops() {
    let harness = Harness::new();
    let resident = harness.resident("ari@example.test");
    let bill = harness.bill(&resident, 5_000);
    harness.gateway.set_status("TX-9", GatewayStatus::Settled);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 5_000, Some("TX-9"));
    harness.gateway.set_outage(true);

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Full, vec![line(&payment, 5_000, TransactionMethod::BackToSource)]),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let id = submission.refund_request.id;
    let detail = harness.engine.refund_requests.get(&harness.system(), id).expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Failed);
    assert_eq!(detail.refunds[0].status, TransactionStatus::RefundFailed);
    assert_eq!(reload(&harness, &bill).status, BillStatus::RefundFailed);

    let process = harness
        .engine
        .registry
        .get(&harness.ctx(), submission.process_id)
        .expect("process");
    assert_eq!(process.status, ProcessStatus::Failed);
    assert_eq!(process.error_code.as_deref(), Some("refund_failed"));

    harness.gateway.set_outage(false);
    let replay = harness.engine.refunds.process(&harness.ctx(), id).await.expect("replay");
    assert!(replay.replayed);
    assert_eq!(replay.status, RefundRequestStatus::Failed);
    assert!(harness.gateway.refund_calls().is_empty());
    assert_eq!(
        harness.engine.refund_requests.get(&harness.system(), id).expect("detail").refunds[0].status,
        TransactionStatus::RefundFailed
    );
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn settled_requests_are_not_refunded_twice() {
    let harness = Harness::new();
    let resident = harness.resident("sam@example.test");
    let bill = harness.bill(&resident, 800);
    harness.gateway.set_status("TX-3", GatewayStatus::Settled);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 800, Some("TX-3"));

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Full, vec![line(&payment, 800, TransactionMethod::BackToSource)]),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;
    assert_eq!(harness.gateway.refund_calls().len(), 1);

    let replay = harness
        .engine
        .refunds
        .process(&harness.ctx(), submission.refund_request.id)
        .await
        .expect("replay");
    assert!(replay.replayed);
    assert_eq!(replay.status, RefundRequestStatus::Completed);
    assert_eq!(harness.gateway.refund_calls().len(), 1);

    let parent = harness
        .engine
        .payments
        .transaction(&harness.system(), payment.id)
        .expect("parent");
    assert_eq!(parent.refunded_amount, 800);
}

#[tokio::test]
async fn a_second_request_waits_for_the_first() {
    let harness = Harness::new();
    let resident = harness.resident("jo@example.test");
    let bill = harness.bill(&resident, 1_000);
    let cash = harness.payment(&bill, TransactionMethod::Cash, 1_000, None);

    harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 100, TransactionMethod::Cash)]),
        )
        .await
        .expect("first accepted");

    let err = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 100, TransactionMethod::Cash)]),
        )
        .await
        .expect_err("second rejected while the first is pending");
    assert!(matches!(err, PaymentError::RefundInProgress(id) if id == bill.id));

    harness.run_tasks().await;
    harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 100, TransactionMethod::Cash)]),
        )
        .await
        .expect("accepted once the first settled");
}

#[tokio::test]
async fn refunds_cannot_exceed_what_the_parent_has_left() {
    let harness = Harness::new();
    let resident = harness.resident("ro@example.test");
    let bill = harness.bill(&resident, 500);
    let cash = harness.payment(&bill, TransactionMethod::Cash, 500, None);

    let err = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 600, TransactionMethod::Cash)]),
        )
        .await
        .expect_err("over-refund rejected");
    assert!(matches!(err, PaymentError::ExceedsParent { .. } | PaymentError::ExceedsRefundable { .. }));
    assert!(harness.engine.broker.scheduled().is_empty());
}

#[tokio::test]
async fn settled_refunds_queue_a_resident_email() {
    let harness = Harness::new();
    let resident = harness.resident("mo@example.test");
    let bill = harness.bill(&resident, 400);
    let cash = harness.payment(&bill, TransactionMethod::Cash, 400, None);

    harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Full, vec![line(&cash, 400, TransactionMethod::Cash)]),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let drained = harness.engine.notifications.drain(&harness.ctx()).await.expect("drain");
    assert_eq!(drained.sent, 1);
    assert_eq!(harness.transport.sent().len(), 1);
}

#[tokio::test]
async fn payments_beyond_the_balance_are_refused() {
    let harness = Harness::new();
    let resident = harness.resident("vi@example.test");
    let bill = harness.bill(&resident, 100);
    harness.payment(&bill, TransactionMethod::Cash, 80, None);

    let err = harness
        .engine
        .payments
        .record_payment(
            &harness.system(),
            bill.id,
            NewPayment {
                method: TransactionMethod::Cash,
                amount: 80,
                currency: "USD".to_string(),
                gateway_txn_id: None,
                gateway_status: None,
                status: TransactionStatus::Completed,
                idempotency_key: None,
            },
        )
        .expect_err("overpayment rejected");
    assert!(matches!(err, PaymentError::ExceedsBalance { requested: 80, outstanding: 20, .. }));

    let bill = reload(&harness, &bill);
    assert_eq!(bill.paid_amount, 80);
    assert!(bill.paid_amount <= bill.amount);
}

#[tokio::test]
async fn voiding_an_authorization_refunds_all_of_it() {
    let harness = Harness::new();
    let resident = harness.resident("ode@example.test");
    let bill = harness.bill(&resident, 200);
    harness.gateway.set_status("TX-A1", GatewayStatus::AuthOk);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 200, Some("TX-A1"));

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&payment, 50, TransactionMethod::BackToSource)]),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    let refund = &detail.refunds[0];
    assert_eq!(refund.status, TransactionStatus::Completed);
    assert_eq!(refund.methodology, Some(RefundMethodology::Void));
    assert_eq!(refund.amount, 200);
    assert_eq!(detail.refund_request.total_refund_processed, 200);

    let parent = harness
        .engine
        .payments
        .transaction(&harness.system(), payment.id)
        .expect("parent");
    assert_eq!(parent.refunded_amount, 200);
    assert_eq!(parent.status, TransactionStatus::Refunded);

    let bill = reload(&harness, &bill);
    assert_eq!(bill.refunded_amount, 200);
    assert_eq!(bill.refundable_amount, 0);
    assert_eq!(bill.status, BillStatus::Refunded);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn mixed_methods_keep_bill_and_parents_in_step() {
    let harness = Harness::new();
    let resident = harness.resident("ines@example.test");
    let bill = harness.bill(&resident, 1_000);
    harness.gateway.set_status("TX-M1", GatewayStatus::Settled);

    let cases = [
        (TransactionMethod::Cash, None, TransactionMethod::Cash, 100),
        (TransactionMethod::Cash, None, TransactionMethod::Wallet, 50),
        (TransactionMethod::Cash, None, TransactionMethod::WriteOff, 250),
        (TransactionMethod::OnlineCard, Some("TX-M1"), TransactionMethod::BackToSource, 80),
    ];
    let mut lines = Vec::new();
    let mut parents = Vec::new();
    for (paid_with, gateway_txn_id, refund_with, amount) in cases {
        let payment = harness.payment(&bill, paid_with, 250, gateway_txn_id);
        lines.push(line(&payment, amount, refund_with));
        parents.push((payment, amount));
    }

    let submission = harness
        .engine
        .refund_requests
        .create(&harness.system(), bill.id, request(RefundType::Partial, lines))
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Completed);
    assert_eq!(detail.refund_request.total_refund_processed, 480);

    let mut refunded_by_parents = 0;
    for (payment, amount) in &parents {
        let parent = harness
            .engine
            .payments
            .transaction(&harness.system(), payment.id)
            .expect("parent");
        assert_eq!(parent.refunded_amount, *amount, "{:?}", payment.method);
        refunded_by_parents += parent.refunded_amount;
    }

    let bill = reload(&harness, &bill);
    assert!(bill.paid_amount <= bill.amount);
    assert!(bill.refunded_amount <= bill.paid_amount);
    assert_eq!(bill.refunded_amount, refunded_by_parents);
    assert_eq!(bill.refundable_amount, 1_000 - 480);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn a_parent_named_twice_is_refunded_once() {
    let harness = Harness::new();
    let resident = harness.resident("per@example.test");
    let bill = harness.bill(&resident, 600);
    harness.gateway.set_status("TX-D1", GatewayStatus::Settled);
    let payment = harness.payment(&bill, TransactionMethod::OnlineCard, 600, Some("TX-D1"));

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(
                RefundType::Partial,
                vec![
                    line(&payment, 100, TransactionMethod::BackToSource),
                    line(&payment, 100, TransactionMethod::BackToSource),
                ],
            ),
        )
        .await
        .expect("accepted");
    harness.run_tasks().await;

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::PartialSuccess);
    let failed: Vec<_> = detail
        .refunds
        .iter()
        .filter(|refund| refund.status == TransactionStatus::RefundFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    let body = failed[0].error_body.as_ref().expect("error body");
    assert_eq!(body["errors"][0]["code"], "duplicate_refund_attempt");
    assert_eq!(harness.gateway.refund_calls().len(), 1);

    let parent = harness
        .engine
        .payments
        .transaction(&harness.system(), payment.id)
        .expect("parent");
    assert_eq!(parent.refunded_amount, 100);
    assert_bill_balances(&harness, &bill);
}

#[tokio::test]
async fn requests_behind_a_swept_process_are_failed_and_release_the_bill() {
    let harness = Harness::new();
    let resident = harness.resident("una@example.test");
    let bill = harness.bill(&resident, 1_000);
    let cash = harness.payment(&bill, TransactionMethod::Cash, 1_000, None);

    let submission = harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 100, TransactionMethod::Cash)]),
        )
        .await
        .expect("accepted");

    let ctx = harness.ctx();
    harness
        .engine
        .registry
        .transition(&ctx, submission.process_id, ProcessStatus::Running, ProcessUpdate::default())
        .expect("running");
    harness.clock.advance(chrono::Duration::hours(3));
    assert_eq!(
        harness
            .engine
            .registry
            .sweep_stale(&ctx, chrono::Duration::hours(1))
            .expect("sweep"),
        1
    );

    let detail = harness
        .engine
        .refund_requests
        .get(&harness.system(), submission.refund_request.id)
        .expect("detail");
    assert_eq!(detail.refund_request.status, RefundRequestStatus::Failed);
    assert_eq!(detail.refunds[0].status, TransactionStatus::RefundFailed);
    let body = detail.refunds[0].error_body.as_ref().expect("error body");
    assert_eq!(body["errors"][0]["code"], "refund_process_ended");
    assert_eq!(reload(&harness, &bill).refundable_amount, 1_000);

    harness
        .engine
        .refund_requests
        .create(
            &harness.system(),
            bill.id,
            request(RefundType::Partial, vec![line(&cash, 100, TransactionMethod::Cash)]),
        )
        .await
        .expect("the bill is free for a new request");
}
