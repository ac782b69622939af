//! Query handler: the single read path for clients.
//!
//! Status answers come from the store; log answers come from the live
//! capture buffers while a task runs and from the output table once the
//! buffers have been flushed. Failures travel through the correlated
//! response, never as handler errors.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use offload_db::models::OutputStream;
use offload_db::queries::{dependencies, outputs, tasks};

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, QueryResponse, handler};
use crate::output::{OutputCapture, TaskOutputSnapshot};

use super::{Handler, SubscriptionSet};

pub struct QueryHandler {
    pool: SqlitePool,
    capture: Arc<OutputCapture>,
    subscriptions: SubscriptionSet,
}

impl QueryHandler {
    pub fn new(pool: SqlitePool, capture: Arc<OutputCapture>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            capture,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event, bus: &EventBus) -> KernelResult<()> {
        match event {
            Event::TaskStatusQuery {
                correlation_id,
                task_id,
            } => {
                let result = self.status(task_id).await;
                if !bus.respond(correlation_id, result.map(QueryResponse::Status)) {
                    debug!(%correlation_id, "status response arrived after the request timed out");
                }
            }
            Event::TaskLogsQuery {
                correlation_id,
                task_id,
                tail,
            } => {
                let result = self.logs(task_id, tail).await;
                if !bus.respond(correlation_id, result.map(QueryResponse::Logs)) {
                    debug!(%correlation_id, "logs response arrived after the request timed out");
                }
            }
            other => {
                debug!(kind = ?other.kind(), "query handler ignoring event");
            }
        }
        Ok(())
    }

    async fn status(
        &self,
        task_id: Option<Uuid>,
    ) -> KernelResult<Vec<offload_db::models::Task>> {
        match task_id {
            Some(id) => {
                let mut task = tasks::get_task(&self.pool, id)
                    .await
                    .map_err(KernelError::from)?
                    .ok_or_else(|| KernelError::task_not_found(id))?;
                task.depends_on = dependencies::edges_for_task(&self.pool, id)
                    .await
                    .map_err(KernelError::from)?
                    .into_iter()
                    .map(|edge| edge.depends_on_task_id)
                    .collect();
                Ok(vec![task])
            }
            None => tasks::list_tasks(&self.pool, tasks::DEFAULT_PAGE_LIMIT, 0)
                .await
                .map_err(KernelError::from),
        }
    }

    async fn logs(
        &self,
        task_id: Uuid,
        tail: Option<usize>,
    ) -> KernelResult<TaskOutputSnapshot> {
        // Confirm the task exists before deciding where its logs live.
        tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::task_not_found(task_id))?;

        if let Some(snapshot) = self.capture.get_output(task_id, tail) {
            return Ok(snapshot);
        }

        // Buffers already evicted: serve the flushed copy.
        let tail_i64 = tail.filter(|n| *n > 0).map(|n| n as i64);
        let stdout =
            outputs::fetch_stream(&self.pool, task_id, OutputStream::Stdout, tail_i64)
                .await
                .map_err(KernelError::from)?;
        let stderr =
            outputs::fetch_stream(&self.pool, task_id, OutputStream::Stderr, tail_i64)
                .await
                .map_err(KernelError::from)?;
        let total_bytes = outputs::total_bytes(&self.pool, task_id)
            .await
            .map_err(KernelError::from)? as u64;

        Ok(TaskOutputSnapshot {
            stdout,
            stderr,
            total_bytes,
        })
    }
}

#[async_trait]
impl Handler for QueryHandler {
    fn name(&self) -> &'static str {
        "query"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        for kind in [EventKind::TaskStatusQuery, EventKind::TaskLogsQuery] {
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
