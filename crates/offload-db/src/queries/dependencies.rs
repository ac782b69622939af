//! Database query functions for the `task_dependencies` table.
//!
//! Edge insertion and the cycle check run inside one transaction so that a
//! rejected batch leaves no partial edges behind.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DependencyResolution, TaskDependency};

/// Errors from inserting a dependency batch.
#[derive(Debug, Error)]
pub enum DependencyInsertError {
    /// The new edge would make `depends_on_task_id` reachable from itself.
    #[error("dependency of {task_id} on {depends_on} would create a cycle")]
    Cycle { task_id: Uuid, depends_on: Uuid },

    /// The referenced task does not exist.
    #[error("dependency target {0} does not exist")]
    UnknownTask(Uuid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Insert one edge per entry of `depends_on`, all or nothing.
///
/// Each edge is cycle-checked against the edges already present plus the
/// ones inserted earlier in this same batch (they are visible inside the
/// transaction). Any failure rolls the whole batch back.
pub async fn insert_edges(
    pool: &SqlitePool,
    task_id: Uuid,
    depends_on: &[Uuid],
) -> Result<(), DependencyInsertError> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin transaction")?;

    for &dep in depends_on {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM tasks WHERE id = ?")
                .bind(dep)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to check dependency target")?;
        let Some((status,)) = status else {
            return Err(DependencyInsertError::UnknownTask(dep));
        };

        if reaches(&mut tx, dep, task_id).await? {
            return Err(DependencyInsertError::Cycle {
                task_id,
                depends_on: dep,
            });
        }

        // A parent that is already terminal resolves its edge on the spot;
        // otherwise the edge would wait forever on an event that fired in
        // the past.
        let (resolution, resolved_at) = match status.as_str() {
            "completed" => ("completed", Some(Utc::now())),
            "failed" => ("failed", Some(Utc::now())),
            "cancelled" => ("cancelled", Some(Utc::now())),
            _ => ("pending", None),
        };

        sqlx::query(
            "INSERT INTO task_dependencies \
                 (id, task_id, depends_on_task_id, created_at, resolved_at, resolution) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (task_id, depends_on_task_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(task_id)
        .bind(dep)
        .bind(Utc::now())
        .bind(resolved_at)
        .bind(resolution)
        .execute(&mut *tx)
        .await
        .context("failed to insert dependency edge")?;
    }

    tx.commit().await.context("failed to commit transaction")?;

    Ok(())
}

/// Depth-first reachability: can `from` reach `target` by following
/// depends-on edges? Used by the cycle check before inserting
/// `target -> from`.
async fn reaches(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from: Uuid,
    target: Uuid,
) -> Result<bool> {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut stack = vec![from];

    while let Some(current) = stack.pop() {
        if current == target {
            return Ok(true);
        }
        if !visited.insert(current) {
            continue;
        }

        let next: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ?",
        )
        .bind(current)
        .fetch_all(&mut **tx)
        .await
        .context("failed to walk dependency graph")?;

        stack.extend(next.into_iter().map(|(id,)| id));
    }

    Ok(false)
}

/// Mark every pending edge pointing at `parent` with the given resolution.
///
/// One UPDATE for the whole fan-out. Returns the number of edges resolved.
pub async fn resolve_batch(
    pool: &SqlitePool,
    parent: Uuid,
    resolution: DependencyResolution,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_dependencies SET resolution = ?, resolved_at = ? \
         WHERE depends_on_task_id = ? AND resolution = 'pending'",
    )
    .bind(resolution)
    .bind(Utc::now())
    .bind(parent)
    .execute(pool)
    .await
    .context("failed to batch-resolve dependency edges")?;

    Ok(result.rows_affected())
}

/// IDs of every task with an edge pointing at `parent`.
pub async fn dependents_of(pool: &SqlitePool, parent: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT DISTINCT task_id FROM task_dependencies WHERE depends_on_task_id = ?",
    )
    .bind(parent)
    .fetch_all(pool)
    .await
    .context("failed to list dependents")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Edge-resolution summary for one dependent task.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeSummary {
    /// Edges still waiting on a parent.
    pub pending: i64,
    /// Edges resolved as anything other than `completed`.
    pub unresolved_failed: i64,
}

/// Summarize the edges of a single task.
pub async fn edge_summary(pool: &SqlitePool, task_id: Uuid) -> Result<EdgeSummary> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT \
             COALESCE(SUM(resolution = 'pending'), 0), \
             COALESCE(SUM(resolution NOT IN ('pending', 'completed')), 0) \
         FROM task_dependencies WHERE task_id = ?",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to summarize dependency edges")?;

    Ok(EdgeSummary {
        pending: row.0,
        unresolved_failed: row.1,
    })
}

/// All edges of a single task.
pub async fn edges_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<TaskDependency>> {
    let edges = sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch dependency edges")?;

    Ok(edges)
}

/// Every unresolved edge in the store, for rebuilding the in-memory
/// dependent index at startup. Unbounded by design.
pub async fn all_pending_unbounded(pool: &SqlitePool) -> Result<Vec<TaskDependency>> {
    let edges = sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE resolution = 'pending'",
    )
    .fetch_all(pool)
    .await
    .context("failed to load pending dependency edges")?;

    Ok(edges)
}
