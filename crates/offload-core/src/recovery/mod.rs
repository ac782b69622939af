//! Startup reconciliation.
//!
//! Runs once after the store is open and the handlers are live, before the
//! worker handler may spawn. Tasks found mid-flight are failed (their
//! children died with the previous process); queued tasks re-enter the
//! queue when their dependencies allow; the dependency index is rebuilt
//! from the pending edges. Failures here degrade the kernel but never
//! abort startup.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};

use offload_db::models::TaskStatus;
use offload_db::queries::{dependencies, tasks};

use crate::events::{Event, EventBus};
use crate::handlers::dependency::DependencyHandler;
use crate::queue::TaskQueue;

/// What recovery found and did.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    /// Mid-flight tasks transitioned to failed.
    pub failed: usize,
    /// Queued tasks put back on the ready queue.
    pub requeued: usize,
    /// Queued tasks left waiting on unresolved dependencies.
    pub blocked: usize,
}

/// Reconcile the store with reality after a restart.
pub async fn run(
    pool: &SqlitePool,
    bus: &Arc<EventBus>,
    queue: &Arc<TaskQueue>,
    dependency_handler: &DependencyHandler,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    // 1. Anything marked running lost its child with the old process.
    //    Emitting the failure runs the full terminal path: persistence,
    //    edge resolution, dependent cascade, checkpoints.
    match tasks::list_by_status_unbounded(pool, TaskStatus::Running).await {
        Ok(running) => {
            for task in running {
                warn!(task_id = %task.id, "failing task orphaned by restart");
                if let Err(err) = bus
                    .emit(Event::TaskFailed {
                        task_id: task.id,
                        exit_code: Some(-1),
                        error: "server restart".to_string(),
                    })
                    .await
                {
                    warn!(task_id = %task.id, error = %err, "orphan cleanup emit failed");
                }
                report.failed += 1;
            }
        }
        Err(err) => {
            warn!(error = %err, "recovery could not list running tasks");
        }
    }

    // 2. Queued tasks go back on the queue only when every edge resolved
    //    completed; a failed edge fails them, pending edges keep them
    //    blocked.
    match tasks::list_by_status_unbounded(pool, TaskStatus::Queued).await {
        Ok(queued) => {
            for task in queued {
                let summary = match dependencies::edge_summary(pool, task.id).await {
                    Ok(summary) => summary,
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "recovery could not read edges");
                        continue;
                    }
                };

                if summary.pending > 0 {
                    report.blocked += 1;
                    continue;
                }
                if summary.unresolved_failed > 0 {
                    if let Err(err) = bus
                        .emit(Event::TaskFailed {
                            task_id: task.id,
                            exit_code: None,
                            error: "unresolved failed dependency".to_string(),
                        })
                        .await
                    {
                        warn!(task_id = %task.id, error = %err, "dependency failure emit failed");
                    }
                    report.failed += 1;
                    continue;
                }

                if queue.enqueue(&task) {
                    report.requeued += 1;
                    if let Err(err) = bus.emit(Event::TaskQueued { task_id: task.id }).await {
                        warn!(task_id = %task.id, error = %err, "requeue emit failed");
                    }
                }
            }
        }
        Err(err) => {
            warn!(error = %err, "recovery could not list queued tasks");
        }
    }

    // 3. Rebuild the dependent index from the authoritative edge table.
    match dependencies::all_pending_unbounded(pool).await {
        Ok(edges) => dependency_handler.rebuild(&edges),
        Err(err) => {
            warn!(error = %err, "recovery could not rebuild the dependency index");
        }
    }

    info!(
        failed = report.failed,
        requeued = report.requeued,
        blocked = report.blocked,
        "recovery completed"
    );
    let _ = bus
        .emit(Event::RecoveryCompleted {
            requeued: report.requeued,
            failed: report.failed,
        })
        .await;

    report
}
