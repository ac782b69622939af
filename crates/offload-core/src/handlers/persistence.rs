//! Persistence handler: the store-side shadow of every task transition.
//!
//! Terminal writes go through `finish_task`, whose optimistic WHERE clause
//! makes replayed terminal events harmless, and which resolves dependent
//! edges in the same transaction as the status flip.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use offload_db::models::TaskStatus;
use offload_db::queries::{outputs, tasks};

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::output::OutputCapture;

use super::{Handler, SubscriptionSet};

pub struct PersistenceHandler {
    pool: SqlitePool,
    capture: Arc<OutputCapture>,
    subscriptions: SubscriptionSet,
}

impl PersistenceHandler {
    pub fn new(pool: SqlitePool, capture: Arc<OutputCapture>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            capture,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event, bus: &EventBus) -> KernelResult<()> {
        match event {
            Event::TaskDelegated { task } => {
                crate::retry::storage("insert task", || tasks::insert_task(&self.pool, &task))
                    .await
                    .map_err(KernelError::from)?;
                bus.emit(Event::TaskPersisted { task }).await?;
            }
            Event::TaskStarting { task_id } => {
                let rows = tasks::mark_running(&self.pool, task_id, Utc::now())
                    .await
                    .map_err(KernelError::from)?;
                if rows == 0 {
                    warn!(task_id = %task_id, "task was not queued when starting; leaving as-is");
                }
            }
            Event::TaskCompleted { task_id, exit_code } => {
                self.finish(task_id, TaskStatus::Completed, Some(exit_code), None)
                    .await?;
            }
            Event::TaskFailed {
                task_id,
                exit_code,
                error,
            } => {
                self.finish(task_id, TaskStatus::Failed, exit_code, Some(error))
                    .await?;
            }
            Event::TaskCancelled {
                task_id,
                reason,
                exit_code,
            } => {
                self.finish(
                    task_id,
                    TaskStatus::Cancelled,
                    exit_code,
                    reason.or_else(|| Some("cancelled".to_string())),
                )
                .await?;
            }
            Event::TaskTimeout {
                task_id,
                timeout_ms,
            } => {
                self.finish(
                    task_id,
                    TaskStatus::Failed,
                    Some(-1),
                    Some(format!("TIMEOUT: task exceeded {timeout_ms} ms")),
                )
                .await?;
            }
            other => {
                debug!(kind = ?other.kind(), "persistence handler ignoring event");
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        exit_code: Option<i64>,
        error_message: Option<String>,
    ) -> KernelResult<()> {
        let completed_at = Utc::now();
        let rows = crate::retry::storage("finish task", || {
            tasks::finish_task(
                &self.pool,
                task_id,
                status,
                exit_code,
                error_message.as_deref(),
                completed_at,
            )
        })
        .await
        .map_err(KernelError::from)?;

        if rows == 0 {
            debug!(task_id = %task_id, "terminal event replay, task already settled");
            return Ok(());
        }

        // Flush the in-memory buffers to the output table, then hand the
        // buffers over to LRU retention.
        if let Some(snapshot) = self.capture.take(task_id) {
            outputs::persist_output(&self.pool, task_id, &snapshot.stdout, &snapshot.stderr)
                .await
                .map_err(KernelError::from)?;
            self.capture.mark_completed(task_id);
        }

        Ok(())
    }
}

#[async_trait]
impl Handler for PersistenceHandler {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        let kinds = [
            EventKind::TaskDelegated,
            EventKind::TaskStarting,
            EventKind::TaskCompleted,
            EventKind::TaskFailed,
            EventKind::TaskCancelled,
            EventKind::TaskTimeout,
        ];
        for kind in kinds {
            let this = Arc::clone(&self);
            let bus_ref = Arc::clone(&bus);
            let id = bus.subscribe(
                kind,
                handler(move |event| {
                    let this = Arc::clone(&this);
                    let bus_ref = Arc::clone(&bus_ref);
                    async move { this.handle(event, &bus_ref).await }
                }),
            )?;
            self.subscriptions.record(id);
        }
        Ok(())
    }

    async fn stop(&self, bus: &EventBus) -> KernelResult<()> {
        self.subscriptions.clear(bus);
        Ok(())
    }
}
