//! Process registry rules observed through a running engine: uniqueness,
//! the state machine, stale sweeps and periodic scheduling.

mod common;

use chrono::Duration;
use common::Harness;
use resido::ids::RequestId;
use resido::process::{
    NewProcess, Process, ProcessError, ProcessFilter, ProcessStatus, ProcessType, ProcessUpdate, Trigger,
    PROCESS_TERMINATED_BY_SYSTEM,
};
use resido::tenancy::TenantState;

fn assignment(object_id: &str) -> NewProcess {
    NewProcess::adhoc(ProcessType::VisitTypeAssignment, RequestId::new()).for_object(object_id, "visit types")
}

fn running(harness: &Harness, object_id: &str) -> Process {
    let ctx = harness.ctx();
    let registry = &harness.engine.registry;
    let process = registry.create(&ctx, assignment(object_id)).expect("created");
    registry
        .transition(&ctx, process.id, ProcessStatus::Running, ProcessUpdate::default())
        .expect("running")
}

#[test]
fn sweep_fails_only_processes_past_the_threshold() {
    let harness = Harness::new();
    let ctx = harness.ctx();
    let registry = &harness.engine.registry;

    let stale = running(&harness, "unit-a");
    harness.clock.advance(Duration::seconds(570));
    let fresh = running(&harness, "unit-b");
    harness.clock.advance(Duration::seconds(30));

    assert_eq!(registry.sweep_stale(&ctx, Duration::minutes(5)).expect("sweep"), 1);

    let stale = registry.get(&ctx, stale.id).expect("stale");
    assert_eq!(stale.status, ProcessStatus::Failed);
    assert_eq!(stale.error_code.as_deref(), Some(PROCESS_TERMINATED_BY_SYSTEM));
    assert_eq!(stale.error_status, Some(400));
    assert!(!stale.active);
    assert_eq!(registry.get(&ctx, fresh.id).expect("fresh").status, ProcessStatus::Running);

    assert_eq!(registry.sweep_stale(&ctx, Duration::minutes(5)).expect("second sweep"), 0);
}

#[test]
fn one_process_per_request_id() {
    let harness = Harness::new();
    let ctx = harness.ctx();
    let request_id = RequestId::new();

    harness
        .engine
        .registry
        .create(&ctx, NewProcess::adhoc(ProcessType::VisitTypeAssignment, request_id).for_object("a", "a"))
        .expect("first");
    let err = harness
        .engine
        .registry
        .create(&ctx, NewProcess::adhoc(ProcessType::VisitTypeAssignment, request_id).for_object("b", "b"))
        .expect_err("duplicate request id");
    assert!(matches!(err, ProcessError::DuplicateRequest(id) if id == request_id));
}

#[test]
fn one_in_flight_process_per_object() {
    let harness = Harness::new();
    let ctx = harness.ctx();
    let registry = &harness.engine.registry;

    let first = running(&harness, "property-7");
    let err = registry.create(&ctx, assignment("property-7")).expect_err("in flight");
    assert!(matches!(err, ProcessError::NonTerminalExists { .. }));

    registry
        .transition(&ctx, first.id, ProcessStatus::Completed, ProcessUpdate::default())
        .expect("completed");
    registry.create(&ctx, assignment("property-7")).expect("allowed once the first is terminal");
}

#[test]
fn terminal_processes_do_not_move() {
    let harness = Harness::new();
    let ctx = harness.ctx();
    let registry = &harness.engine.registry;

    let queued = registry.create(&ctx, assignment("lease-1")).expect("created");
    let err = registry
        .transition(&ctx, queued.id, ProcessStatus::Completed, ProcessUpdate::default())
        .expect_err("queued cannot complete");
    assert!(matches!(
        err,
        ProcessError::InvalidTransition {
            from: ProcessStatus::Queued,
            to: ProcessStatus::Completed
        }
    ));

    let process = running(&harness, "lease-2");
    registry
        .transition(&ctx, process.id, ProcessStatus::Failed, ProcessUpdate::default())
        .expect("failed");
    let err = registry
        .transition(&ctx, process.id, ProcessStatus::Running, ProcessUpdate::default())
        .expect_err("terminal");
    assert!(matches!(err, ProcessError::AlreadyTerminal { .. }));
}

#[test]
fn task_ids_are_attached_once() {
    let harness = Harness::new();
    let ctx = harness.ctx();
    let registry = &harness.engine.registry;
    let task_id = uuid::Uuid::new_v4();

    let process = registry.create(&ctx, assignment("floor-3")).expect("created");
    registry.set_task_id(&ctx, process.id, task_id).expect("attached");
    registry.set_task_id(&ctx, process.id, task_id).expect("same id again is a no-op");

    let err = registry
        .set_task_id(&ctx, process.id, uuid::Uuid::new_v4())
        .expect_err("different id");
    assert!(matches!(err, ProcessError::TaskIdAlreadySet(id) if id == process.id));

    let other = registry.create(&ctx, assignment("floor-4")).expect("created");
    let err = registry.set_task_id(&ctx, other.id, task_id).expect_err("task id taken");
    assert!(matches!(err, ProcessError::DuplicateTaskId(id) if id == task_id));
}

#[test]
fn tenants_never_see_each_others_processes() {
    let harness = Harness::new();
    let other = harness.provision("globex");
    let other_ctx = harness.engine.tenant_context(other);

    let process = running(&harness, "shared-object");
    let err = harness.engine.registry.get(&other_ctx, process.id).expect_err("isolated");
    assert!(matches!(err, ProcessError::NotFound(_)));
    harness
        .engine
        .registry
        .create(&other_ctx, assignment("shared-object"))
        .expect("same object id is independent per tenant");
}

#[tokio::test]
async fn scheduler_runs_each_periodic_task_once_per_interval() {
    let harness = Harness::new();

    let first = harness.engine.scheduler.tick().await;
    assert_eq!(first.enqueued, 3);
    let again = harness.engine.scheduler.tick().await;
    assert_eq!(again.enqueued, 0);

    assert_eq!(harness.run_tasks().await, 3);

    let page = harness
        .engine
        .registry
        .list(&harness.system(), &ProcessFilter::default())
        .expect("list");
    assert_eq!(page.total, 3);
    assert!(page
        .items
        .iter()
        .all(|process| process.trigger == Trigger::Periodic && process.status == ProcessStatus::Completed));
}

#[tokio::test]
async fn tasks_for_suspended_tenants_are_dropped() {
    let harness = Harness::new();
    harness.engine.scheduler.tick().await;
    harness
        .engine
        .directory
        .set_state(harness.tenant.id, TenantState::Suspended)
        .expect("suspended");

    assert_eq!(harness.run_tasks().await, 3);
    harness
        .engine
        .directory
        .set_state(harness.tenant.id, TenantState::Active)
        .expect("active");

    let queued = harness
        .engine
        .registry
        .list(
            &harness.system(),
            &ProcessFilter {
                status: Some(ProcessStatus::Queued),
                ..ProcessFilter::default()
            },
        )
        .expect("list");
    assert_eq!(queued.total, 3);
}
