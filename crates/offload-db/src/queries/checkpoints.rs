//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::TaskCheckpoint;

/// Append a checkpoint for a task. The AUTOINCREMENT id preserves insert
/// order, so "latest" is simply the highest id.
pub async fn insert_checkpoint(
    pool: &SqlitePool,
    task_id: Uuid,
    prompt: &str,
    exit_code: Option<i64>,
    output_tail: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO checkpoints (task_id, prompt, exit_code, output_tail, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(prompt)
    .bind(exit_code)
    .bind(output_tail)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(())
}

/// The most recent checkpoint of a task, if any.
pub async fn latest_checkpoint(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Option<TaskCheckpoint>> {
    let checkpoint = sqlx::query_as::<_, TaskCheckpoint>(
        "SELECT * FROM checkpoints WHERE task_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}
