//! Database query functions for the `tasks` table.
//!
//! Status transitions use optimistic locking: the UPDATE's WHERE clause
//! names the expected current status, so a stale caller affects zero rows
//! instead of clobbering a concurrent transition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{DependencyState, Task, TaskStatus};

/// Default page size for list queries.
pub const DEFAULT_PAGE_LIMIT: i64 = 100;

/// Insert a fully-constructed task row.
pub async fn insert_task(pool: &SqlitePool, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (id, prompt, priority, working_directory, status, \
                            exit_code, error_message, created_at, started_at, completed_at, \
                            retry_count, parent_task_id, retry_of, dependency_state, \
                            use_worktree, branch, base_branch, merge_strategy, worktree_cleanup, \
                            auto_commit, push_to_remote, pr_title, pr_body, \
                            timeout_ms, max_output_buffer_bytes, continue_from) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id)
    .bind(&task.prompt)
    .bind(task.priority)
    .bind(&task.working_directory)
    .bind(task.status)
    .bind(task.exit_code)
    .bind(&task.error_message)
    .bind(task.created_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.retry_count)
    .bind(task.parent_task_id)
    .bind(task.retry_of)
    .bind(task.dependency_state)
    .bind(task.use_worktree)
    .bind(&task.branch)
    .bind(&task.base_branch)
    .bind(task.merge_strategy)
    .bind(task.worktree_cleanup)
    .bind(task.auto_commit)
    .bind(task.push_to_remote)
    .bind(&task.pr_title)
    .bind(&task.pr_body)
    .bind(task.timeout_ms)
    .bind(task.max_output_buffer_bytes)
    .bind(task.continue_from)
    .execute(pool)
    .await
    .context("failed to insert task")?;

    Ok(())
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks newest-first, paginated.
pub async fn list_tasks(pool: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// List every task with the given status, oldest first, without pagination.
///
/// Only graph/queue initialization at startup may use this; all
/// client-facing listings go through [`list_tasks`].
pub async fn list_by_status_unbounded(
    pool: &SqlitePool,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Transition a queued task to running, stamping `started_at`.
///
/// Returns the number of rows affected (0 means the task was not queued).
pub async fn mark_running(
    pool: &SqlitePool,
    id: Uuid,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'running', started_at = ? \
         WHERE id = ? AND status = 'queued'",
    )
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected())
}

/// Move a task into a terminal state and resolve, in the same transaction,
/// every still-pending dependency edge that points at it.
///
/// The edge update is a single batch UPDATE rather than one statement per
/// dependent. Returns the number of task rows affected: 0 means the task
/// was already terminal (or missing) and nothing was changed.
pub async fn finish_task(
    pool: &SqlitePool,
    id: Uuid,
    status: TaskStatus,
    exit_code: Option<i64>,
    error_message: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    debug_assert!(status.is_terminal());

    let resolution = match status {
        TaskStatus::Completed => "completed",
        TaskStatus::Cancelled => "cancelled",
        _ => "failed",
    };

    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE tasks SET status = ?, exit_code = ?, error_message = ?, completed_at = ? \
         WHERE id = ? AND status IN ('queued', 'running')",
    )
    .bind(status)
    .bind(exit_code)
    .bind(error_message)
    .bind(completed_at)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to finish task")?;

    if result.rows_affected() > 0 {
        sqlx::query(
            "UPDATE task_dependencies SET resolution = ?, resolved_at = ? \
             WHERE depends_on_task_id = ? AND resolution = 'pending'",
        )
        .bind(resolution)
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to resolve dependency edges")?;
    }

    tx.commit().await.context("failed to commit transaction")?;

    Ok(result.rows_affected())
}

/// Update a task's aggregate dependency state.
pub async fn set_dependency_state(
    pool: &SqlitePool,
    id: Uuid,
    state: DependencyState,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET dependency_state = ? WHERE id = ?")
        .bind(state)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set dependency state")?;

    Ok(result.rows_affected())
}

/// Record the worktree branch assigned to a task.
pub async fn set_branch(pool: &SqlitePool, id: Uuid, branch: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET branch = ? WHERE id = ?")
        .bind(branch)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set task branch")?;

    Ok(())
}

/// Delete terminal tasks whose completion is older than `cutoff`.
///
/// Outputs, edges, and checkpoints go with them via cascade. Returns the
/// number of tasks removed.
pub async fn delete_terminal_before(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tasks \
         WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to delete expired tasks")?;

    Ok(result.rows_affected())
}
