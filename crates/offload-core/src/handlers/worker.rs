//! Worker handler: the only component that spawns or kills workers.
//!
//! Its scheduling loop runs on every event that could change the answer to
//! "can another task start now": a task entered the queue, resources were
//! re-sampled, or a worker slot was freed by a terminal event. Spawning
//! stays disabled until recovery has reconciled the store.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offload_db::models::{Task, TaskStatus};
use offload_db::queries::tasks;

use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::monitor::ResourceMonitor;
use crate::output::OutputCapture;
use crate::queue::TaskQueue;
use crate::workers::WorkerPool;
use crate::worktree::WorktreeManager;

use super::{Handler, SubscriptionSet};

pub struct WorkerHandler {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    workers: Arc<WorkerPool>,
    monitor: Arc<ResourceMonitor>,
    capture: Arc<OutputCapture>,
    spawn_enabled: AtomicBool,
    subscriptions: SubscriptionSet,
}

impl WorkerHandler {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        queue: Arc<TaskQueue>,
        workers: Arc<WorkerPool>,
        monitor: Arc<ResourceMonitor>,
        capture: Arc<OutputCapture>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            queue,
            workers,
            monitor,
            capture,
            spawn_enabled: AtomicBool::new(false),
            subscriptions: SubscriptionSet::new(),
        })
    }

    /// Open the spawn gate (recovery has finished) and immediately try to
    /// fill available slots.
    pub async fn enable_spawning(&self) {
        self.spawn_enabled.store(true, Ordering::SeqCst);
        self.pump().await;
    }

    async fn handle(&self, event: Event) -> KernelResult<()> {
        match event {
            Event::TaskCancellationRequested { task_id, reason } => {
                self.cancel(task_id, reason).await?;
            }
            Event::TaskQueued { .. }
            | Event::SystemResourcesUpdated { .. }
            | Event::TaskCompleted { .. }
            | Event::TaskFailed { .. }
            | Event::TaskCancelled { .. }
            | Event::TaskTimeout { .. } => {
                self.pump().await;
            }
            other => {
                debug!(kind = ?other.kind(), "worker handler ignoring event");
            }
        }
        Ok(())
    }

    /// Validate and route a cancellation request.
    async fn cancel(&self, task_id: Uuid, reason: Option<String>) -> KernelResult<()> {
        let task = tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::task_not_found(task_id))?;

        if task.status.is_terminal() {
            return Err(KernelError::new(
                ErrorCode::TaskCannotCancel,
                format!("task {task_id} is already {}", task.status),
            ));
        }

        match task.status {
            TaskStatus::Queued => {
                // Never reached a worker: drop it from the queue and settle
                // it directly.
                self.queue.remove(task_id);
                self.bus
                    .emit(Event::TaskCancelled {
                        task_id,
                        reason,
                        exit_code: None,
                    })
                    .await?;
            }
            TaskStatus::Running => {
                if !self.workers.kill_task(task_id, reason) {
                    // The worker settled in the meantime; its terminal
                    // event is already on the way.
                    debug!(task_id = %task_id, "cancellation raced a worker exit");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Start queued tasks while admission allows and the queue has work.
    async fn pump(&self) {
        if !self.spawn_enabled.load(Ordering::SeqCst) {
            return;
        }

        loop {
            if !self.monitor.can_spawn_worker() {
                break;
            }
            let Some(task_id) = self.queue.dequeue() else {
                break;
            };
            if let Err(err) = self.start_task(task_id).await {
                warn!(task_id = %task_id, error = %err, "failed to start task");
            }
        }
    }

    async fn start_task(&self, task_id: Uuid) -> KernelResult<()> {
        let task = match tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
        {
            Some(task) if task.status == TaskStatus::Queued => task,
            Some(task) => {
                debug!(task_id = %task_id, status = %task.status, "dequeued task no longer queued");
                return Ok(());
            }
            None => {
                warn!(task_id = %task_id, "dequeued task vanished from the store");
                return Ok(());
            }
        };

        self.bus.emit(Event::TaskStarting { task_id }).await?;

        // The cancellation path may have won between dequeue and here; the
        // store is the referee.
        let task = match tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
        {
            Some(task) if task.status == TaskStatus::Running => task,
            _ => {
                debug!(task_id = %task_id, "task settled before its worker could spawn");
                return Ok(());
            }
        };

        let working_dir = match self.resolve_working_dir(&task).await {
            Ok(dir) => dir,
            Err(err) => {
                self.bus
                    .emit(Event::TaskFailed {
                        task_id,
                        exit_code: None,
                        error: err.message.clone(),
                    })
                    .await?;
                return Ok(());
            }
        };

        self.capture
            .register(task_id, task.max_output_buffer_bytes.max(0) as u64);

        // The pool emits TaskStarted itself, before the output pumps run.
        match self.workers.spawn(&task, &working_dir).await {
            Ok(info) => {
                info!(task_id = %task_id, pid = info.pid, "task started");
            }
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "spawn failed");
                self.bus
                    .emit(Event::TaskFailed {
                        task_id,
                        exit_code: None,
                        error: err.to_string(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// The directory the child runs in: the task's working directory, or a
    /// dedicated worktree of it when isolation was requested.
    async fn resolve_working_dir(&self, task: &Task) -> KernelResult<PathBuf> {
        if !task.use_worktree {
            return Ok(PathBuf::from(&task.working_directory));
        }

        let manager = WorktreeManager::new(&task.working_directory, None).map_err(|e| {
            KernelError::invalid_directory(format!(
                "worktree requested but {} is not a git repository: {e}",
                task.working_directory
            ))
        })?;

        let branch = task
            .branch
            .clone()
            .unwrap_or_else(|| WorktreeManager::branch_name(task.id));

        let path = manager
            .create_worktree(&branch, task.base_branch.as_deref())
            .map_err(|e| {
                KernelError::system(format!("failed to create worktree for task: {e}"))
            })?;

        tasks::set_branch(&self.pool, task.id, &branch)
            .await
            .map_err(KernelError::from)?;

        Ok(path)
    }
}

#[async_trait]
impl Handler for WorkerHandler {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        let mut kinds = vec![
            EventKind::TaskQueued,
            EventKind::SystemResourcesUpdated,
            EventKind::TaskCancellationRequested,
        ];
        kinds.extend(Event::TERMINAL_KINDS);
        for kind in kinds {
            let this = Arc::clone(&self);
            let id = bus.subscribe(
                kind,
                handler(move |event| {
                    let this = Arc::clone(&this);
                    async move { this.handle(event).await }
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
