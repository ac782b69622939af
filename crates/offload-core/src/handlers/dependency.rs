//! Dependency handler: records DAG edges for new tasks, resolves them when
//! parents settle, and releases or fails dependents accordingly.
//!
//! The in-memory dependent index (parent -> dependents) is a derived view
//! rebuilt by recovery; the edge table stays authoritative.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offload_db::models::{DependencyResolution, DependencyState, TaskDependency, TaskStatus};
use offload_db::queries::dependencies::{self, DependencyInsertError};
use offload_db::queries::tasks;

use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};

use super::{Handler, SubscriptionSet};

pub struct DependencyHandler {
    pool: SqlitePool,
    /// parent task id -> ids of tasks waiting on it.
    dependents: Mutex<HashMap<Uuid, HashSet<Uuid>>>,
    subscriptions: SubscriptionSet,
}

impl DependencyHandler {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            dependents: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionSet::new(),
        })
    }

    /// Replace the dependent index with the given pending edges (recovery).
    pub fn rebuild(&self, edges: &[TaskDependency]) {
        let mut index = self.dependents.lock().unwrap_or_else(|e| e.into_inner());
        index.clear();
        for edge in edges {
            index
                .entry(edge.depends_on_task_id)
                .or_default()
                .insert(edge.task_id);
        }
    }

    fn index_edges(&self, task_id: Uuid, parents: &[Uuid]) {
        let mut index = self.dependents.lock().unwrap_or_else(|e| e.into_inner());
        for parent in parents {
            index.entry(*parent).or_default().insert(task_id);
        }
    }

    fn take_dependents(&self, parent: Uuid) -> Option<HashSet<Uuid>> {
        self.dependents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&parent)
    }

    async fn handle(&self, event: Event, bus: &EventBus) -> KernelResult<()> {
        match event {
            Event::TaskDelegated { task } => self.on_delegated(task, bus).await,
            Event::TaskCompleted { task_id, .. } => {
                self.on_parent_settled(task_id, DependencyResolution::Completed, bus)
                    .await
            }
            Event::TaskFailed { task_id, .. } | Event::TaskTimeout { task_id, .. } => {
                self.on_parent_settled(task_id, DependencyResolution::Failed, bus)
                    .await
            }
            Event::TaskCancelled { task_id, .. } => {
                self.on_parent_settled(task_id, DependencyResolution::Cancelled, bus)
                    .await
            }
            other => {
                debug!(kind = ?other.kind(), "dependency handler ignoring event");
                Ok(())
            }
        }
    }

    async fn on_delegated(
        &self,
        task: offload_db::models::Task,
        bus: &EventBus,
    ) -> KernelResult<()> {
        if task.depends_on.is_empty() {
            return Ok(());
        }

        if let Err(err) = dependencies::insert_edges(&self.pool, task.id, &task.depends_on).await
        {
            let kernel_err = match &err {
                DependencyInsertError::Cycle { depends_on, .. } => KernelError::new(
                    ErrorCode::DependencyCycle,
                    format!("dependency on {depends_on} would create a cycle"),
                )
                .with_context("task_id", task.id.to_string()),
                DependencyInsertError::UnknownTask(id) => {
                    KernelError::validation(format!("dependency target {id} does not exist"))
                        .with_context("task_id", task.id.to_string())
                }
                DependencyInsertError::Other(e) => KernelError::storage(format!("{e:#}")),
            };

            // The whole edge set failed, so the task cannot run.
            warn!(task_id = %task.id, error = %kernel_err, "dependency registration failed");
            let _ = bus
                .emit(Event::TaskFailed {
                    task_id: task.id,
                    exit_code: None,
                    error: kernel_err.message.clone(),
                })
                .await;
            return Err(kernel_err);
        }

        self.index_edges(task.id, &task.depends_on);
        // The queue handler runs after this one on TaskDelegated and
        // re-reads the row, so a task whose parents already settled needs
        // its state fixed here but no TaskUnblocked.
        self.reconcile_dependent(task.id, bus, false).await
    }

    async fn on_parent_settled(
        &self,
        parent: Uuid,
        resolution: DependencyResolution,
        bus: &EventBus,
    ) -> KernelResult<()> {
        // The persistence handler already resolved the edges inside the
        // finish transaction; this batch UPDATE only matters for paths that
        // bypassed it, and is a no-op otherwise.
        dependencies::resolve_batch(&self.pool, parent, resolution)
            .await
            .map_err(KernelError::from)?;

        let dependents = match self.take_dependents(parent) {
            Some(set) => set,
            None => dependencies::dependents_of(&self.pool, parent)
                .await
                .map_err(KernelError::from)?
                .into_iter()
                .collect(),
        };

        for dependent in dependents {
            self.reconcile_dependent(dependent, bus, true).await?;
        }
        Ok(())
    }

    /// Decide whether a task with edges is now ready, still blocked, or
    /// doomed, and act on it.
    async fn reconcile_dependent(
        &self,
        task_id: Uuid,
        bus: &EventBus,
        emit_unblocked: bool,
    ) -> KernelResult<()> {
        let summary = dependencies::edge_summary(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?;

        if summary.pending > 0 {
            tasks::set_dependency_state(&self.pool, task_id, DependencyState::Blocked)
                .await
                .map_err(KernelError::from)?;
            return Ok(());
        }

        let task = match tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
        {
            Some(task) => task,
            None => return Ok(()),
        };
        if task.status != TaskStatus::Queued {
            return Ok(());
        }

        if summary.unresolved_failed > 0 {
            tasks::set_dependency_state(&self.pool, task_id, DependencyState::UnresolvedFailed)
                .await
                .map_err(KernelError::from)?;

            let rows = tasks::finish_task(
                &self.pool,
                task_id,
                TaskStatus::Failed,
                None,
                Some("unresolved failed dependency"),
                Utc::now(),
            )
            .await
            .map_err(KernelError::from)?;

            if rows > 0 {
                info!(task_id = %task_id, "failing task whose dependency did not complete");
                // Cascades to this task's own dependents.
                let _ = bus
                    .emit(Event::TaskFailed {
                        task_id,
                        exit_code: None,
                        error: "unresolved failed dependency".to_string(),
                    })
                    .await;
            }
            return Ok(());
        }

        tasks::set_dependency_state(&self.pool, task_id, DependencyState::Ready)
            .await
            .map_err(KernelError::from)?;

        if emit_unblocked {
            let mut task = task;
            task.dependency_state = DependencyState::Ready;
            bus.emit(Event::TaskUnblocked { task }).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for DependencyHandler {
    fn name(&self) -> &'static str {
        "dependency"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        let mut kinds = vec![EventKind::TaskDelegated];
        kinds.extend(Event::TERMINAL_KINDS);
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
