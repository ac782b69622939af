//! Schedule scenarios: trigger materialization, advance/complete rules,
//! missed-run policies, chaining, and front-door transitions. Ticks are
//! forced directly so tests never wait out the executor interval.

mod common;

use chrono::{Duration, Utc};

use common::{request, start_kernel, wait_for_terminal};
use offload_core::error::ErrorCode;
use offload_core::kernel::KernelOptions;
use offload_core::scheduler::CreateScheduleRequest;
use offload_db::models::{
    DependencyState, ExecutionStatus, MissedRunPolicy, ScheduleStatus, ScheduleType, TaskStatus,
};
use offload_db::queries::schedules;
use offload_test_utils::create_test_db;

fn cron_request(prompt: &str) -> CreateScheduleRequest {
    CreateScheduleRequest {
        task_template: request(prompt),
        schedule_type: ScheduleType::Cron,
        cron_expression: Some("*/1 * * * *".to_string()),
        scheduled_at: None,
        timezone: None,
        missed_run_policy: None,
        max_runs: None,
        expires_at: None,
        after_schedule_id: None,
    }
}

fn one_time_request(prompt: &str, at: chrono::DateTime<Utc>) -> CreateScheduleRequest {
    CreateScheduleRequest {
        task_template: request(prompt),
        schedule_type: ScheduleType::OneTime,
        cron_expression: None,
        scheduled_at: Some(at),
        timezone: None,
        missed_run_policy: None,
        max_runs: None,
        expires_at: None,
        after_schedule_id: None,
    }
}

#[tokio::test]
async fn cron_trigger_materializes_a_task_and_advances() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let schedule = tk
        .kernel
        .schedules
        .create(cron_request("echo tick"))
        .await
        .unwrap();
    assert_eq!(schedule.status, ScheduleStatus::Active);
    let first_slot = schedule.next_run_at.unwrap();
    assert!(first_slot > Utc::now());

    // Pull the slot into the (recent) past and force a tick.
    let due_at = Utc::now() - Duration::seconds(10);
    schedules::set_next_run(&db.pool, &schedule.id, Some(due_at))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(updated.run_count, 1);
    assert!(updated.last_run_at.is_some());
    assert!(updated.next_run_at.unwrap() > due_at, "next_run_at must advance");

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Triggered);
    let task_id = history[0].task_id.expect("trigger creates a task");

    // The materialized task matches the template and actually runs.
    let status = tk.kernel.manager.get_status(Some(task_id)).await.unwrap();
    assert_eq!(status[0].prompt, "echo tick");
    wait_for_terminal(&tk.events, task_id).await;

    // A second tick with the slot in the future does nothing.
    tk.kernel.executor.tick(Utc::now()).await;
    let (_, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(history.len(), 1, "no double trigger before the next slot");

    tk.kernel.stop().await;
}

#[tokio::test]
async fn live_previous_run_skips_the_slot() {
    let db = create_test_db().await;
    let mut options = KernelOptions::default();
    options.enable_workers = false;
    let tk = start_kernel(&db, options, |_| {}).await;

    let schedule = tk
        .kernel
        .schedules
        .create(cron_request("echo slow"))
        .await
        .unwrap();

    schedules::set_next_run(&db.pool, &schedule.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    // The triggered task sits queued forever (workers are off). Force the
    // schedule due again: the live guard must refuse to double-schedule.
    schedules::set_next_run(&db.pool, &schedule.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (_, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(history.len(), 1, "live run must suppress re-triggering");

    tk.kernel.stop().await;
}

#[tokio::test]
async fn one_time_schedule_completes_after_firing() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    // Due now, well inside the grace period.
    let schedule = tk
        .kernel
        .schedules
        .create(one_time_request("echo once", Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();

    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(updated.status, ScheduleStatus::Completed);
    assert_eq!(updated.next_run_at, None);
    assert_eq!(updated.run_count, 1);

    let task_id = history[0].task_id.unwrap();
    wait_for_terminal(&tk.events, task_id).await;

    tk.kernel.stop().await;
}

#[tokio::test]
async fn max_runs_completes_the_schedule() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let mut req = cron_request("echo capped");
    req.max_runs = Some(1);
    let schedule = tk.kernel.schedules.create(req).await.unwrap();

    schedules::set_next_run(&db.pool, &schedule.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, _) = tk.kernel.schedules.get(&schedule.id, false).await.unwrap();
    assert_eq!(updated.status, ScheduleStatus::Completed);
    assert_eq!(updated.run_count, 1);
    assert_eq!(updated.next_run_at, None);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn missed_run_policy_skip_records_and_advances() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let schedule = tk
        .kernel
        .schedules
        .create(cron_request("echo skipped"))
        .await
        .unwrap();

    // Ten minutes late, grace is five.
    let missed_slot = Utc::now() - Duration::minutes(10);
    schedules::set_next_run(&db.pool, &schedule.id, Some(missed_slot))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(updated.status, ScheduleStatus::Active);
    assert!(updated.next_run_at.unwrap() > Utc::now());
    // Skips do not count as runs.
    assert_eq!(updated.run_count, 0);

    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Skipped);
    assert_eq!(history[0].task_id, None);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn missed_run_policy_fail_cancels_the_schedule() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let mut req = cron_request("echo doomed");
    req.missed_run_policy = Some(MissedRunPolicy::Fail);
    let schedule = tk.kernel.schedules.create(req).await.unwrap();

    schedules::set_next_run(&db.pool, &schedule.id, Some(Utc::now() - Duration::minutes(10)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(updated.status, ScheduleStatus::Cancelled);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Missed);
    assert!(history[0].error_message.is_some());

    tk.kernel.stop().await;
}

#[tokio::test]
async fn missed_run_policy_catchup_fires_the_original_slot() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let mut req = cron_request("echo late but present");
    req.missed_run_policy = Some(MissedRunPolicy::Catchup);
    let schedule = tk.kernel.schedules.create(req).await.unwrap();

    let missed_slot = Utc::now() - Duration::minutes(10);
    schedules::set_next_run(&db.pool, &schedule.id, Some(missed_slot))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;

    let (updated, history) = tk.kernel.schedules.get(&schedule.id, true).await.unwrap();
    assert_eq!(updated.run_count, 1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Triggered);
    // The execution names the original slot; lateness is observable.
    assert_eq!(history[0].scheduled_for, missed_slot);
    assert!(history[0].task_id.is_some());

    tk.kernel.stop().await;
}

#[tokio::test]
async fn chained_schedule_depends_on_live_predecessor_task() {
    let db = create_test_db().await;
    let mut options = KernelOptions::default();
    options.enable_workers = false;
    let tk = start_kernel(&db, options, |_| {}).await;

    let first = tk
        .kernel
        .schedules
        .create(cron_request("echo first"))
        .await
        .unwrap();
    let mut chained_req = cron_request("echo second");
    chained_req.after_schedule_id = Some(first.id.clone());
    let chained = tk.kernel.schedules.create(chained_req).await.unwrap();

    // Fire the first schedule; its task stays queued (workers off).
    schedules::set_next_run(&db.pool, &first.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;
    let (_, history) = tk.kernel.schedules.get(&first.id, true).await.unwrap();
    let first_task = history[0].task_id.unwrap();

    // Fire the chained schedule: its task must depend on the live one.
    schedules::set_next_run(&db.pool, &chained.id, Some(Utc::now() - Duration::seconds(5)))
        .await
        .unwrap();
    tk.kernel.executor.tick(Utc::now()).await;
    let (_, history) = tk.kernel.schedules.get(&chained.id, true).await.unwrap();
    let chained_task = history[0].task_id.unwrap();

    let status = tk
        .kernel
        .manager
        .get_status(Some(chained_task))
        .await
        .unwrap();
    assert_eq!(status[0].depends_on, vec![first_task]);
    assert_eq!(status[0].dependency_state, DependencyState::Blocked);
    assert_eq!(status[0].status, TaskStatus::Queued);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn front_door_transitions_are_validated() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let err = tk.kernel.schedules.get("sch_missing", false).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ScheduleNotFound);

    let schedule = tk
        .kernel
        .schedules
        .create(cron_request("echo lifecycle"))
        .await
        .unwrap();

    tk.kernel.schedules.pause(&schedule.id).await.unwrap();
    let err = tk.kernel.schedules.pause(&schedule.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    tk.kernel.schedules.resume(&schedule.id).await.unwrap();
    let (resumed, _) = tk.kernel.schedules.get(&schedule.id, false).await.unwrap();
    assert_eq!(resumed.status, ScheduleStatus::Active);
    assert!(resumed.next_run_at.unwrap() > Utc::now());

    tk.kernel.schedules.cancel(&schedule.id).await.unwrap();
    let err = tk.kernel.schedules.cancel(&schedule.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    // Shape validation at create time.
    let mut invalid = cron_request("echo bad");
    invalid.cron_expression = None;
    let err = tk.kernel.schedules.create(invalid).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    let mut bad_zone = cron_request("echo zoned");
    bad_zone.timezone = Some("Mars/Olympus".to_string());
    let err = tk.kernel.schedules.create(bad_zone).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    tk.kernel.stop().await;
}
