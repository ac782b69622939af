//! Integration tests for task CRUD and status transitions.
//!
//! Each test creates its own temporary SQLite database via
//! `offload-test-utils`, so tests are fully isolated.

use chrono::{Duration, Utc};
use uuid::Uuid;

use offload_db::models::{DependencyState, TaskStatus};
use offload_db::queries::{dependencies, outputs, tasks};
use offload_test_utils::{create_test_db, sample_task};

#[tokio::test]
async fn insert_and_get_roundtrip() {
    let db = create_test_db().await;

    let task = sample_task("echo hi");
    tasks::insert_task(&db.pool, &task).await.unwrap();

    let fetched = tasks::get_task(&db.pool, task.id)
        .await
        .unwrap()
        .expect("task should exist");

    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.prompt, "echo hi");
    assert_eq!(fetched.status, TaskStatus::Queued);
    assert_eq!(fetched.priority, task.priority);
    assert_eq!(fetched.parent_task_id, task.id);
    assert_eq!(fetched.retry_of, None);
    assert_eq!(fetched.timeout_ms, task.timeout_ms);
    assert!(fetched.completed_at.is_none());
}

#[tokio::test]
async fn get_missing_task_returns_none() {
    let db = create_test_db().await;
    let found = tasks::get_task(&db.pool, Uuid::new_v4()).await.unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn mark_running_is_optimistic() {
    let db = create_test_db().await;

    let task = sample_task("sleep 1");
    tasks::insert_task(&db.pool, &task).await.unwrap();

    let rows = tasks::mark_running(&db.pool, task.id, Utc::now()).await.unwrap();
    assert_eq!(rows, 1);

    // Second attempt sees status=running and affects nothing.
    let rows = tasks::mark_running(&db.pool, task.id, Utc::now()).await.unwrap();
    assert_eq!(rows, 0);

    let fetched = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Running);
    assert!(fetched.started_at.is_some());
}

#[tokio::test]
async fn finish_task_sets_terminal_fields() {
    let db = create_test_db().await;

    let task = sample_task("echo done");
    tasks::insert_task(&db.pool, &task).await.unwrap();
    tasks::mark_running(&db.pool, task.id, Utc::now()).await.unwrap();

    let rows = tasks::finish_task(
        &db.pool,
        task.id,
        TaskStatus::Completed,
        Some(0),
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let fetched = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Completed);
    assert_eq!(fetched.exit_code, Some(0));
    assert!(fetched.completed_at.is_some());
}

#[tokio::test]
async fn finish_task_is_idempotent() {
    let db = create_test_db().await;

    let task = sample_task("echo once");
    tasks::insert_task(&db.pool, &task).await.unwrap();

    let first = tasks::finish_task(
        &db.pool,
        task.id,
        TaskStatus::Cancelled,
        None,
        Some("cancelled before start"),
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(first, 1);

    // A replayed terminal event must not overwrite the first outcome.
    let second = tasks::finish_task(
        &db.pool,
        task.id,
        TaskStatus::Failed,
        Some(1),
        Some("late failure"),
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(second, 0);

    let fetched = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, TaskStatus::Cancelled);
    // Never spawned: exit code stays unset.
    assert_eq!(fetched.exit_code, None);
}

#[tokio::test]
async fn finish_task_resolves_dependent_edges() {
    let db = create_test_db().await;

    let parent = sample_task("parent");
    let child = sample_task("child");
    tasks::insert_task(&db.pool, &parent).await.unwrap();
    tasks::insert_task(&db.pool, &child).await.unwrap();
    dependencies::insert_edges(&db.pool, child.id, &[parent.id])
        .await
        .unwrap();

    tasks::finish_task(
        &db.pool,
        parent.id,
        TaskStatus::Completed,
        Some(0),
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    let summary = dependencies::edge_summary(&db.pool, child.id).await.unwrap();
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.unresolved_failed, 0);

    let edges = dependencies::edges_for_task(&db.pool, child.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert!(edges[0].resolved_at.is_some());
}

#[tokio::test]
async fn list_tasks_paginates_newest_first() {
    let db = create_test_db().await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let mut task = sample_task(&format!("task {i}"));
        task.created_at = Utc::now() + Duration::milliseconds(i);
        tasks::insert_task(&db.pool, &task).await.unwrap();
        ids.push(task.id);
    }

    let page = tasks::list_tasks(&db.pool, 2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, ids[4]);
    assert_eq!(page[1].id, ids[3]);

    let rest = tasks::list_tasks(&db.pool, 100, 2).await.unwrap();
    assert_eq!(rest.len(), 3);
}

#[tokio::test]
async fn dependency_state_updates() {
    let db = create_test_db().await;

    let mut task = sample_task("blocked");
    task.dependency_state = DependencyState::Blocked;
    tasks::insert_task(&db.pool, &task).await.unwrap();

    tasks::set_dependency_state(&db.pool, task.id, DependencyState::Ready)
        .await
        .unwrap();

    let fetched = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.dependency_state, DependencyState::Ready);
}

#[tokio::test]
async fn retention_deletes_old_terminal_tasks_and_cascades() {
    let db = create_test_db().await;

    let task = sample_task("old");
    tasks::insert_task(&db.pool, &task).await.unwrap();
    tasks::finish_task(
        &db.pool,
        task.id,
        TaskStatus::Completed,
        Some(0),
        None,
        Utc::now() - Duration::days(60),
    )
    .await
    .unwrap();

    outputs::persist_output(&db.pool, task.id, &["hi\n".to_string()], &[])
        .await
        .unwrap();

    let removed = tasks::delete_terminal_before(&db.pool, Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(tasks::get_task(&db.pool, task.id).await.unwrap().is_none());
    let chunks = outputs::fetch_stream(
        &db.pool,
        task.id,
        offload_db::models::OutputStream::Stdout,
        None,
    )
    .await
    .unwrap();
    assert!(chunks.is_empty(), "outputs should cascade with the task");
}
