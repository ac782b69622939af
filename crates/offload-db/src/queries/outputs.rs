//! Database query functions for the `task_outputs` table.
//!
//! Output lives in memory while a task runs; these rows are the flushed
//! copy written when the task reaches a terminal state.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::OutputStream;

/// Persist both streams of a finished task in one transaction.
///
/// `ON CONFLICT DO NOTHING` keeps a double flush (e.g. recovery replaying
/// a terminal event) from failing on the composite primary key.
pub async fn persist_output(
    pool: &SqlitePool,
    task_id: Uuid,
    stdout: &[String],
    stderr: &[String],
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    for (stream, chunks) in [(OutputStream::Stdout, stdout), (OutputStream::Stderr, stderr)] {
        for (index, data) in chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO task_outputs (task_id, stream, chunk_index, data) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (task_id, stream, chunk_index) DO NOTHING",
            )
            .bind(task_id)
            .bind(stream)
            .bind(index as i64)
            .bind(data)
            .execute(&mut *tx)
            .await
            .context("failed to insert output chunk")?;
        }
    }

    tx.commit().await.context("failed to commit transaction")?;

    Ok(())
}

/// Fetch one stream's chunks in order. With `tail = Some(n)` only the last
/// `n` chunks are returned (still in chronological order).
pub async fn fetch_stream(
    pool: &SqlitePool,
    task_id: Uuid,
    stream: OutputStream,
    tail: Option<i64>,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = match tail {
        Some(n) => {
            let mut rows: Vec<(String,)> = sqlx::query_as(
                "SELECT data FROM task_outputs \
                 WHERE task_id = ? AND stream = ? \
                 ORDER BY chunk_index DESC LIMIT ?",
            )
            .bind(task_id)
            .bind(stream)
            .bind(n)
            .fetch_all(pool)
            .await
            .context("failed to fetch output tail")?;
            rows.reverse();
            rows
        }
        None => sqlx::query_as(
            "SELECT data FROM task_outputs \
             WHERE task_id = ? AND stream = ? \
             ORDER BY chunk_index ASC",
        )
        .bind(task_id)
        .bind(stream)
        .fetch_all(pool)
        .await
        .context("failed to fetch output")?,
    };

    Ok(rows.into_iter().map(|(data,)| data).collect())
}

/// Total stored bytes across both streams of a task.
pub async fn total_bytes(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(length(CAST(data AS BLOB))), 0) \
         FROM task_outputs WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to sum output size")?;

    Ok(row.0)
}
