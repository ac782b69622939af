//! End-to-end kernel scenarios: delegation through completion, priority
//! ordering, dependency gating and failure propagation, timeout,
//! cancellation, and the retry chain.

mod common;

use uuid::Uuid;

use common::{position, request, start_kernel, wait_for_event, wait_for_terminal};
use offload_core::error::ErrorCode;
use offload_core::events::Event;
use offload_core::kernel::KernelOptions;
use offload_db::models::{DependencyState, TaskPriority, TaskStatus};
use offload_test_utils::create_test_db;

#[tokio::test]
async fn delegated_task_runs_to_completion_in_order() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let task = tk
        .kernel
        .manager
        .delegate(request("echo hi"))
        .await
        .expect("delegate");
    assert_eq!(task.status, TaskStatus::Queued);

    let terminal = wait_for_terminal(&tk.events, task.id).await;
    assert!(matches!(terminal, Event::TaskCompleted { exit_code: 0, .. }));

    // Per-task event order: delegated < persisted < queued < starting <
    // started < output < completed.
    let id = task.id;
    let order = [
        position(&tk.events, |ev| matches!(ev, Event::TaskDelegated { task } if task.id == id)),
        position(&tk.events, |ev| matches!(ev, Event::TaskPersisted { task } if task.id == id)),
        position(&tk.events, |ev| matches!(ev, Event::TaskQueued { task_id } if *task_id == id)),
        position(&tk.events, |ev| matches!(ev, Event::TaskStarting { task_id } if *task_id == id)),
        position(&tk.events, |ev| matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == id)),
        position(&tk.events, |ev| matches!(ev, Event::OutputCaptured { task_id, .. } if *task_id == id)),
        position(&tk.events, |ev| matches!(ev, Event::TaskCompleted { task_id, .. } if *task_id == id)),
    ];
    for pair in order.windows(2) {
        let (a, b) = (pair[0].expect("event missing"), pair[1].expect("event missing"));
        assert!(a < b, "event order violated: {order:?}");
    }

    let status = tk.kernel.manager.get_status(Some(id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Completed);
    assert_eq!(status[0].exit_code, Some(0));
    assert!(status[0].completed_at.is_some());

    let logs = tk.kernel.manager.get_logs(id, None).await.unwrap();
    assert_eq!(logs.stdout.concat(), "hi\n");

    tk.kernel.stop().await;
}

#[tokio::test]
async fn higher_priority_task_starts_first() {
    let db = create_test_db().await;
    let mut options = KernelOptions::default();
    options.enable_workers = false;
    let tk = start_kernel(&db, options, |_| {}).await;

    let mut low = request("echo low");
    low.priority = Some(TaskPriority::P2);
    let low = tk.kernel.manager.delegate(low).await.unwrap();

    let mut high = request("echo high");
    high.priority = Some(TaskPriority::P0);
    let high = tk.kernel.manager.delegate(high).await.unwrap();

    // Both sit in the queue; opening the gate drains in priority order.
    tk.kernel.enable_spawning().await;

    wait_for_terminal(&tk.events, low.id).await;
    wait_for_terminal(&tk.events, high.id).await;

    let high_started = position(&tk.events, |ev| {
        matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == high.id)
    })
    .unwrap();
    let low_started = position(&tk.events, |ev| {
        matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == low.id)
    })
    .unwrap();
    assert!(
        high_started < low_started,
        "P0 task should start before the earlier-submitted P2 task"
    );

    tk.kernel.stop().await;
}

#[tokio::test]
async fn dependent_task_waits_for_its_parent() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let parent = tk
        .kernel
        .manager
        .delegate(request("sleep 0.2; echo parent"))
        .await
        .unwrap();

    let mut child_req = request("echo child");
    child_req.depends_on = vec![parent.id];
    let child = tk.kernel.manager.delegate(child_req).await.unwrap();
    assert_eq!(child.dependency_state, DependencyState::Blocked);

    wait_for_terminal(&tk.events, child.id).await;

    // The child was released only after the parent settled.
    let parent_done = position(&tk.events, |ev| {
        matches!(ev, Event::TaskCompleted { task_id, .. } if *task_id == parent.id)
    })
    .unwrap();
    let unblocked = position(&tk.events, |ev| {
        matches!(ev, Event::TaskUnblocked { task } if task.id == child.id)
    })
    .expect("child should emit TaskUnblocked");
    let child_started = position(&tk.events, |ev| {
        matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == child.id)
    })
    .unwrap();
    assert!(parent_done < unblocked);
    assert!(unblocked < child_started);

    let status = tk.kernel.manager.get_status(Some(child.id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Completed);
    assert_eq!(status[0].dependency_state, DependencyState::Ready);
    assert_eq!(status[0].depends_on, vec![parent.id]);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn failed_parent_fails_dependent_without_running_it() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let parent = tk
        .kernel
        .manager
        .delegate(request("exit 2"))
        .await
        .unwrap();

    let mut child_req = request("echo never");
    child_req.depends_on = vec![parent.id];
    let child = tk.kernel.manager.delegate(child_req).await.unwrap();

    let terminal = wait_for_terminal(&tk.events, child.id).await;
    match terminal {
        Event::TaskFailed { error, .. } => {
            assert!(error.contains("unresolved failed dependency"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    assert!(
        position(&tk.events, |ev| {
            matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == child.id)
        })
        .is_none(),
        "dependent of a failed task must never start"
    );

    let status = tk.kernel.manager.get_status(Some(child.id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Failed);
    assert_eq!(
        status[0].dependency_state,
        DependencyState::UnresolvedFailed
    );

    tk.kernel.stop().await;
}

#[tokio::test]
async fn runaway_task_is_timed_out() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let mut req = request("sleep 30");
    req.timeout_ms = Some(1_000);
    let task = tk.kernel.manager.delegate(req).await.unwrap();

    let terminal = wait_for_terminal(&tk.events, task.id).await;
    assert!(matches!(
        terminal,
        Event::TaskTimeout { timeout_ms: 1_000, .. }
    ));

    let status = tk.kernel.manager.get_status(Some(task.id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Failed);
    assert_eq!(status[0].exit_code, Some(-1));
    assert!(status[0].error_message.as_deref().unwrap().contains("TIMEOUT"));

    tk.kernel.stop().await;
}

#[tokio::test]
async fn running_task_cancels_and_double_cancel_is_rejected() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let task = tk
        .kernel
        .manager
        .delegate(request("sleep 30"))
        .await
        .unwrap();

    wait_for_event(&tk.events, "task start", |ev| {
        matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == task.id)
    })
    .await;

    tk.kernel
        .manager
        .cancel(task.id, Some("changed my mind".to_string()))
        .await
        .unwrap();

    let terminal = wait_for_terminal(&tk.events, task.id).await;
    match terminal {
        Event::TaskCancelled { reason, .. } => {
            assert_eq!(reason.as_deref(), Some("changed my mind"));
        }
        other => panic!("expected TaskCancelled, got {other:?}"),
    }

    let status = tk.kernel.manager.get_status(Some(task.id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Cancelled);

    let err = tk.kernel.manager.cancel(task.id, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskCannotCancel);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn queued_task_cancels_without_a_worker() {
    let db = create_test_db().await;
    let mut options = KernelOptions::default();
    options.enable_workers = false;
    let tk = start_kernel(&db, options, |_| {}).await;

    let task = tk
        .kernel
        .manager
        .delegate(request("echo never runs"))
        .await
        .unwrap();
    assert!(tk.kernel.queue.contains(task.id));

    tk.kernel.manager.cancel(task.id, None).await.unwrap();

    let status = tk.kernel.manager.get_status(Some(task.id)).await.unwrap();
    assert_eq!(status[0].status, TaskStatus::Cancelled);
    // Never spawned: no exit code, but completion is stamped.
    assert_eq!(status[0].exit_code, None);
    assert!(status[0].completed_at.is_some());
    assert!(!tk.kernel.queue.contains(task.id));

    tk.kernel.stop().await;
}

#[tokio::test]
async fn retry_builds_a_chain_rooted_at_the_original() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let original = tk
        .kernel
        .manager
        .delegate(request("exit 1"))
        .await
        .unwrap();
    wait_for_terminal(&tk.events, original.id).await;

    let second = tk.kernel.manager.retry(original.id).await.unwrap();
    assert_eq!(second.retry_of, Some(original.id));
    assert_eq!(second.parent_task_id, original.id);
    assert_eq!(second.retry_count, 1);
    wait_for_terminal(&tk.events, second.id).await;

    let third = tk.kernel.manager.retry(second.id).await.unwrap();
    assert_eq!(third.retry_of, Some(second.id));
    assert_eq!(third.parent_task_id, original.id);
    assert_eq!(third.retry_count, 2);
    wait_for_terminal(&tk.events, third.id).await;

    tk.kernel.stop().await;
}

#[tokio::test]
async fn retry_of_live_task_is_rejected() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let task = tk
        .kernel
        .manager
        .delegate(request("sleep 30"))
        .await
        .unwrap();
    wait_for_event(&tk.events, "task start", |ev| {
        matches!(ev, Event::TaskStarted { task_id, .. } if *task_id == task.id)
    })
    .await;

    let err = tk.kernel.manager.retry(task.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidOperation);

    tk.kernel.manager.cancel(task.id, None).await.unwrap();
    wait_for_terminal(&tk.events, task.id).await;
    tk.kernel.stop().await;
}

#[tokio::test]
async fn resume_seeds_the_prompt_from_the_checkpoint() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let original = tk
        .kernel
        .manager
        .delegate(request("echo partial progress; exit 1"))
        .await
        .unwrap();
    wait_for_terminal(&tk.events, original.id).await;

    let resumed = tk
        .kernel
        .manager
        .resume(original.id, Some("pick up where you left off".to_string()))
        .await
        .unwrap();

    assert_eq!(resumed.continue_from, Some(original.id));
    assert_eq!(resumed.retry_of, Some(original.id));
    assert!(resumed.prompt.contains("partial progress"));
    assert!(resumed.prompt.contains("pick up where you left off"));

    wait_for_terminal(&tk.events, resumed.id).await;
    tk.kernel.stop().await;
}

#[tokio::test]
async fn unknown_ids_and_bad_requests_are_typed_errors() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    let ghost = Uuid::new_v4();
    let err = tk.kernel.manager.get_status(Some(ghost)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);

    let err = tk.kernel.manager.get_logs(ghost, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);

    let err = tk.kernel.manager.cancel(ghost, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotFound);

    let err = tk
        .kernel
        .manager
        .delegate(request(""))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    let mut bad_dir = request("hi");
    bad_dir.working_directory = "relative".to_string();
    let err = tk.kernel.manager.delegate(bad_dir).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidDirectory);

    let mut ghost_dep = request("hi");
    ghost_dep.depends_on = vec![ghost];
    let err = tk.kernel.manager.delegate(ghost_dep).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    tk.kernel.stop().await;
}

#[tokio::test]
async fn worktree_task_runs_isolated_and_merges_back() {
    let db = create_test_db().await;
    let tk = start_kernel(&db, KernelOptions::default(), |_| {}).await;

    // A scratch git repository for the task to work in.
    let repo = tempfile::TempDir::new().unwrap();
    let git = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
    };
    git(&["init"]);
    git(&["config", "user.email", "test@offload.dev"]);
    git(&["config", "user.name", "Offload Test"]);
    std::fs::write(repo.path().join("README.md"), "# repo\n").unwrap();
    git(&["add", "."]);
    git(&["commit", "-m", "init"]);

    let mut req = request("echo made-by-task > artifact.txt");
    req.working_directory = repo.path().to_string_lossy().into_owned();
    req.use_worktree = true;
    req.auto_commit = true;
    req.merge_strategy = Some(offload_db::models::MergeStrategy::Auto);
    let task = tk.kernel.manager.delegate(req).await.unwrap();

    let terminal = wait_for_terminal(&tk.events, task.id).await;
    assert!(matches!(terminal, Event::TaskCompleted { .. }));

    // The file never touched the main tree directly; the auto strategy
    // merges it back. The merge runs inside the terminal dispatch, so give
    // it a moment.
    let merged = repo.path().join("artifact.txt");
    let mut found = false;
    for _ in 0..100 {
        if merged.exists() {
            found = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(found, "auto merge did not land the task's work");
    assert_eq!(
        std::fs::read_to_string(&merged).unwrap().trim(),
        "made-by-task"
    );

    let status = tk.kernel.manager.get_status(Some(task.id)).await.unwrap();
    assert_eq!(status[0].branch, Some(format!("offload/{}", task.id)));

    tk.kernel.stop().await;
}

#[tokio::test]
async fn full_queue_rejects_new_delegations() {
    let db = create_test_db().await;
    let mut options = KernelOptions::default();
    options.enable_workers = false;
    let tk = start_kernel(&db, options, |c| {
        c.max_queued_tasks = 1;
    })
    .await;

    tk.kernel.manager.delegate(request("echo one")).await.unwrap();
    let err = tk
        .kernel
        .manager
        .delegate(request("echo two"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ResourceExhausted);

    tk.kernel.stop().await;
}
