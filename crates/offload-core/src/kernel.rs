//! Kernel wiring: constructs every component leaf-first and returns one
//! aggregate with an explicit start/stop lifecycle. No runtime lookup —
//! the types are the registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::events::EventBus;
use crate::handlers::checkpoint::CheckpointHandler;
use crate::handlers::dependency::DependencyHandler;
use crate::handlers::output::OutputHandler;
use crate::handlers::persistence::PersistenceHandler;
use crate::handlers::query::QueryHandler;
use crate::handlers::queue::QueueHandler;
use crate::handlers::schedule::ScheduleHandler;
use crate::handlers::worker::WorkerHandler;
use crate::handlers::worktree::WorktreeHandler;
use crate::handlers::{Handler, HandlerRegistry};
use crate::manager::TaskManager;
use crate::monitor::ResourceMonitor;
use crate::output::OutputCapture;
use crate::queue::TaskQueue;
use crate::recovery::{self, RecoveryReport};
use crate::scheduler::{ScheduleExecutor, ScheduleManager};
use crate::spawner::ProcessSpawner;
use crate::workers::WorkerPool;

/// Which moving parts a kernel instance runs. One-shot CLI commands build
/// a kernel with everything off; `serve` runs the lot.
#[derive(Debug, Clone, Copy)]
pub struct KernelOptions {
    /// Reconcile the store at start and open the spawn gate afterwards.
    pub run_recovery: bool,
    /// Allow the worker handler to spawn children.
    pub enable_workers: bool,
    /// Run the resource sampling loop.
    pub enable_monitor: bool,
    /// Run the schedule tick loop.
    pub enable_scheduler: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            run_recovery: true,
            enable_workers: true,
            enable_monitor: true,
            enable_scheduler: true,
        }
    }
}

impl KernelOptions {
    /// Everything off: handlers answer queries and accept delegations, but
    /// nothing spawns and no timers run.
    pub fn passive() -> Self {
        Self {
            run_recovery: false,
            enable_workers: false,
            enable_monitor: false,
            enable_scheduler: false,
        }
    }
}

/// The assembled kernel.
pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub pool: SqlitePool,
    pub bus: Arc<EventBus>,
    pub queue: Arc<TaskQueue>,
    pub capture: Arc<OutputCapture>,
    pub monitor: Arc<ResourceMonitor>,
    pub workers: Arc<WorkerPool>,
    pub manager: TaskManager,
    pub schedules: ScheduleManager,
    pub executor: Arc<ScheduleExecutor>,

    options: KernelOptions,
    registry: HandlerRegistry,
    worker_handler: Arc<WorkerHandler>,
    dependency: Arc<DependencyHandler>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

/// Build a kernel from a migrated pool. `state_dir` holds ancillary files
/// (patch output). Components are constructed leaf-first; nothing runs
/// until [`Kernel::start`].
pub fn build(
    config: KernelConfig,
    pool: SqlitePool,
    state_dir: PathBuf,
    options: KernelOptions,
) -> Kernel {
    let config = Arc::new(config);

    // Leaves.
    let bus = EventBus::new(
        config.max_listeners_per_event,
        config.max_total_subscriptions,
        config.event_request_timeout(),
    );
    let queue = Arc::new(TaskQueue::new());
    let capture = Arc::new(OutputCapture::new(config.completed_buffer_retention));
    let monitor = ResourceMonitor::new(&config);
    let spawner = Arc::new(ProcessSpawner::new(&config));

    // Composites.
    let workers = WorkerPool::new(
        Arc::clone(&bus),
        Arc::clone(&monitor),
        spawner,
        config.kill_grace_period(),
    );

    // Handlers, registered in the order their subscriptions must fire for
    // a shared event kind: persistence first, then graph bookkeeping, then
    // queueing, then spawning, then everything downstream.
    let persistence = PersistenceHandler::new(pool.clone(), Arc::clone(&capture));
    let dependency = DependencyHandler::new(pool.clone());
    let queue_handler = QueueHandler::new(pool.clone(), Arc::clone(&queue));
    let worker_handler = WorkerHandler::new(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&queue),
        Arc::clone(&workers),
        Arc::clone(&monitor),
        Arc::clone(&capture),
    );
    let output = OutputHandler::new(Arc::clone(&capture));
    let query = QueryHandler::new(pool.clone(), Arc::clone(&capture));
    let schedule = ScheduleHandler::new(pool.clone(), Arc::clone(&config));
    let checkpoint = CheckpointHandler::new(pool.clone(), Arc::clone(&capture));
    let worktree = WorktreeHandler::new(pool.clone(), state_dir.join("patches"));

    let mut registry = HandlerRegistry::new(Arc::clone(&bus));
    registry.register(persistence);
    registry.register(Arc::clone(&dependency) as Arc<dyn Handler>);
    registry.register(queue_handler);
    registry.register(Arc::clone(&worker_handler) as Arc<dyn Handler>);
    registry.register(output);
    registry.register(query);
    registry.register(schedule);
    registry.register(checkpoint);
    registry.register(worktree);

    let manager = TaskManager::new(
        Arc::clone(&bus),
        pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&config),
    );
    let schedules = ScheduleManager::new(pool.clone(), Arc::clone(&config));
    let executor = ScheduleExecutor::new(pool.clone(), Arc::clone(&bus), &config);

    Kernel {
        config,
        pool,
        bus,
        queue,
        capture,
        monitor,
        workers,
        manager,
        schedules,
        executor,
        options,
        registry,
        worker_handler,
        dependency,
        cancel: CancellationToken::new(),
        background: Vec::new(),
    }
}

impl Kernel {
    /// Open the worker spawn gate manually. Only needed when the kernel
    /// was started with `enable_workers` off.
    pub async fn enable_spawning(&self) {
        self.worker_handler.enable_spawning().await;
    }

    /// Bring the kernel up: handlers, recovery, spawn gate, timers.
    pub async fn start(&mut self) -> KernelResult<RecoveryReport> {
        self.registry.start_all().await?;

        let report = if self.options.run_recovery {
            recovery::run(&self.pool, &self.bus, &self.queue, &self.dependency).await
        } else {
            RecoveryReport::default()
        };

        if self.options.enable_workers {
            self.worker_handler.enable_spawning().await;
        }
        if self.options.enable_monitor {
            self.background
                .push(self.monitor.start(Arc::clone(&self.bus), self.cancel.clone()));
        }
        if self.options.enable_scheduler {
            self.background.push(self.executor.start(self.cancel.clone()));
        }

        info!("kernel started");
        Ok(report)
    }

    /// Tear the kernel down in reverse: timers, workers, handlers, bus.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }

        self.workers.kill_all();
        // Give supervisors a moment to emit their terminal events while
        // the handlers still listen.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.workers.worker_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.registry.stop_all().await;
        self.bus.dispose();
        info!("kernel stopped");
    }
}
