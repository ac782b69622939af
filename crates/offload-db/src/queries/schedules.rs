//! Database query functions for the `schedules` and `schedule_executions`
//! tables.
//!
//! Schedule mutation always uses UPDATE, never insert-or-replace: a
//! replaced row would cascade-delete its execution history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::{Schedule, ScheduleExecution, ScheduleStatus};

/// Insert a new schedule row.
pub async fn insert_schedule(pool: &SqlitePool, schedule: &Schedule) -> Result<()> {
    sqlx::query(
        "INSERT INTO schedules (id, task_template, schedule_type, cron_expression, \
                                scheduled_at, timezone, missed_run_policy, status, \
                                max_runs, run_count, last_run_at, next_run_at, \
                                expires_at, after_schedule_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&schedule.id)
    .bind(&schedule.task_template)
    .bind(schedule.schedule_type)
    .bind(&schedule.cron_expression)
    .bind(schedule.scheduled_at)
    .bind(&schedule.timezone)
    .bind(schedule.missed_run_policy)
    .bind(schedule.status)
    .bind(schedule.max_runs)
    .bind(schedule.run_count)
    .bind(schedule.last_run_at)
    .bind(schedule.next_run_at)
    .bind(schedule.expires_at)
    .bind(&schedule.after_schedule_id)
    .bind(schedule.created_at)
    .execute(pool)
    .await
    .context("failed to insert schedule")?;

    Ok(())
}

/// Fetch a single schedule by ID.
pub async fn get_schedule(pool: &SqlitePool, id: &str) -> Result<Option<Schedule>> {
    let schedule = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch schedule")?;

    Ok(schedule)
}

/// List schedules, optionally filtered by status, newest first.
pub async fn list_schedules(
    pool: &SqlitePool,
    status: Option<ScheduleStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Schedule>> {
    let schedules = match status {
        Some(status) => sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules WHERE status = ? \
             ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list schedules")?,
        None => sqlx::query_as::<_, Schedule>(
            "SELECT * FROM schedules ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list schedules")?,
    };

    Ok(schedules)
}

/// All active schedules whose `next_run_at` is at or before `now`.
pub async fn find_due(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let schedules = sqlx::query_as::<_, Schedule>(
        "SELECT * FROM schedules \
         WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ? \
         ORDER BY next_run_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to find due schedules")?;

    Ok(schedules)
}

/// Apply the outcome of a trigger: advance the schedule and record its
/// execution in a single transaction.
pub async fn record_trigger(
    pool: &SqlitePool,
    schedule_id: &str,
    new_status: ScheduleStatus,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: DateTime<Utc>,
    execution: &ScheduleExecution,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query(
        "UPDATE schedules SET status = ?, next_run_at = ?, last_run_at = ?, \
                              run_count = run_count + 1 \
         WHERE id = ?",
    )
    .bind(new_status)
    .bind(next_run_at)
    .bind(last_run_at)
    .bind(schedule_id)
    .execute(&mut *tx)
    .await
    .context("failed to update schedule after trigger")?;

    insert_execution_tx(&mut tx, execution).await?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(())
}

/// Advance a schedule without counting a run (missed-run skip path).
pub async fn advance_schedule(
    pool: &SqlitePool,
    schedule_id: &str,
    new_status: ScheduleStatus,
    next_run_at: Option<DateTime<Utc>>,
    execution: &ScheduleExecution,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    sqlx::query("UPDATE schedules SET status = ?, next_run_at = ? WHERE id = ?")
        .bind(new_status)
        .bind(next_run_at)
        .bind(schedule_id)
        .execute(&mut *tx)
        .await
        .context("failed to advance schedule")?;

    insert_execution_tx(&mut tx, execution).await?;

    tx.commit().await.context("failed to commit transaction")?;

    Ok(())
}

/// Transition a schedule's status with optimistic locking on the current
/// status. Returns rows affected (0 means the status did not match).
pub async fn transition_status(
    pool: &SqlitePool,
    id: &str,
    from: ScheduleStatus,
    to: ScheduleStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE schedules SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition schedule status")?;

    Ok(result.rows_affected())
}

/// Set a schedule's next run time (used when resuming a paused schedule).
pub async fn set_next_run(
    pool: &SqlitePool,
    id: &str,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set next run time")?;

    Ok(())
}

async fn insert_execution_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    execution: &ScheduleExecution,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO schedule_executions (id, schedule_id, task_id, scheduled_for, \
                                          executed_at, status, error_message) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(execution.id)
    .bind(&execution.schedule_id)
    .bind(execution.task_id)
    .bind(execution.scheduled_for)
    .bind(execution.executed_at)
    .bind(execution.status)
    .bind(&execution.error_message)
    .execute(&mut **tx)
    .await
    .context("failed to insert schedule execution")?;

    Ok(())
}

/// Insert a standalone execution record (outside a schedule update).
pub async fn insert_execution(pool: &SqlitePool, execution: &ScheduleExecution) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    insert_execution_tx(&mut tx, execution).await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}

/// The most recent execution record of a schedule, if any.
pub async fn latest_execution(
    pool: &SqlitePool,
    schedule_id: &str,
) -> Result<Option<ScheduleExecution>> {
    let execution = sqlx::query_as::<_, ScheduleExecution>(
        "SELECT * FROM schedule_executions WHERE schedule_id = ? \
         ORDER BY scheduled_for DESC LIMIT 1",
    )
    .bind(schedule_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest execution")?;

    Ok(execution)
}

/// Execution history of a schedule, newest first.
pub async fn list_executions(
    pool: &SqlitePool,
    schedule_id: &str,
    limit: i64,
) -> Result<Vec<ScheduleExecution>> {
    let executions = sqlx::query_as::<_, ScheduleExecution>(
        "SELECT * FROM schedule_executions WHERE schedule_id = ? \
         ORDER BY scheduled_for DESC LIMIT ?",
    )
    .bind(schedule_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list executions")?;

    Ok(executions)
}

/// Mark an execution as failed with an error message.
pub async fn fail_execution(
    pool: &SqlitePool,
    execution_id: Uuid,
    error_message: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE schedule_executions SET status = 'failed', error_message = ? WHERE id = ?",
    )
    .bind(error_message)
    .bind(execution_id)
    .execute(pool)
    .await
    .context("failed to mark execution failed")?;

    Ok(())
}

