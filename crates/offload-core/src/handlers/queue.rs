//! Queue handler: moves ready tasks into the in-memory ready queue.
//!
//! Runs after the dependency handler on `TaskDelegated`, so the row it
//! re-reads already reflects the task's true dependency state.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use offload_db::models::{DependencyState, Task, TaskStatus};
use offload_db::queries::tasks;

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::queue::TaskQueue;

use super::{Handler, SubscriptionSet};

pub struct QueueHandler {
    pool: SqlitePool,
    queue: Arc<TaskQueue>,
    subscriptions: SubscriptionSet,
}

impl QueueHandler {
    pub fn new(pool: SqlitePool, queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            queue,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event, bus: &EventBus) -> KernelResult<()> {
        match event {
            Event::TaskDelegated { task } => {
                // Re-read: the dependency handler may have blocked or
                // failed the task a moment ago.
                let current = tasks::get_task(&self.pool, task.id)
                    .await
                    .map_err(KernelError::from)?;
                if let Some(current) = current {
                    self.enqueue_if_ready(&current, bus).await?;
                }
            }
            Event::TaskUnblocked { task } => {
                self.enqueue_if_ready(&task, bus).await?;
            }
            other => {
                debug!(kind = ?other.kind(), "queue handler ignoring event");
            }
        }
        Ok(())
    }

    async fn enqueue_if_ready(&self, task: &Task, bus: &EventBus) -> KernelResult<()> {
        if task.status != TaskStatus::Queued
            || task.dependency_state != DependencyState::Ready
        {
            return Ok(());
        }
        if self.queue.enqueue(task) {
            bus.emit(Event::TaskQueued { task_id: task.id }).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for QueueHandler {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        for kind in [EventKind::TaskDelegated, EventKind::TaskUnblocked] {
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
