//! The active worker set.
//!
//! Every spawned child is owned by exactly one supervisor task that races
//! child exit, the task's wall-time budget, and a cancellation token in a
//! single `select!`. Whichever branch wins performs the transition; the
//! losing branches simply never run, so the exit/timeout/cancel race needs
//! no lock. Two pump tasks per worker announce stdout and stderr chunks on
//! the bus; the output handler owns the buffer writes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use offload_db::models::{OutputStream, Task};

use crate::error::KernelResult;
use crate::events::{Event, EventBus};
use crate::monitor::ResourceMonitor;
use crate::spawner::ProcessSpawner;

/// Status of a live worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Busy,
    Killed,
}

/// Snapshot of one worker, as returned by lookups.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: Uuid,
    pub task_id: Uuid,
    pub pid: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

struct WorkerMeta {
    last_heartbeat: DateTime<Utc>,
    status: WorkerStatus,
}

struct WorkerEntry {
    worker_id: Uuid,
    pid: u32,
    spawned_at: DateTime<Utc>,
    meta: Arc<Mutex<WorkerMeta>>,
    cancel: CancellationToken,
    cancel_reason: Arc<Mutex<Option<String>>>,
}

type WorkerMap = Arc<Mutex<HashMap<Uuid, WorkerEntry>>>;

/// Owns all running children. One entry per running task, keyed by task id.
pub struct WorkerPool {
    bus: Arc<EventBus>,
    monitor: Arc<ResourceMonitor>,
    spawner: Arc<ProcessSpawner>,
    kill_grace: Duration,
    workers: WorkerMap,
}

impl WorkerPool {
    pub fn new(
        bus: Arc<EventBus>,
        monitor: Arc<ResourceMonitor>,
        spawner: Arc<ProcessSpawner>,
        kill_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            monitor,
            spawner,
            kill_grace,
            workers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Spawn a worker for a task and hand it to a supervisor.
    ///
    /// The caller has already passed admission; this increments the worker
    /// count and records the spawn timestamp for the settling window.
    /// `TaskStarted` is emitted here, before the output pumps exist, so no
    /// `OutputCaptured` can ever precede it.
    pub async fn spawn(&self, task: &Task, working_dir: &Path) -> KernelResult<WorkerInfo> {
        let mut spawned = self.spawner.spawn(&task.prompt, working_dir, task.id)?;

        self.monitor.increment_worker_count();
        self.monitor.record_spawn();

        if let Err(err) = self
            .bus
            .emit(Event::TaskStarted {
                task_id: task.id,
                pid: spawned.pid,
            })
            .await
        {
            warn!(task_id = %task.id, error = %err, "start event emit failed");
        }

        let worker_id = Uuid::new_v4();
        let spawned_at = Utc::now();
        let cancel = CancellationToken::new();
        let cancel_reason = Arc::new(Mutex::new(None));
        let meta = Arc::new(Mutex::new(WorkerMeta {
            last_heartbeat: spawned_at,
            status: WorkerStatus::Busy,
        }));

        let stdout = spawned.child.stdout.take();
        let stderr = spawned.child.stderr.take();

        let mut pumps = Vec::new();
        if let Some(stdout) = stdout {
            pumps.push(self.pump(task.id, OutputStream::Stdout, stdout, Arc::clone(&meta)));
        }
        if let Some(stderr) = stderr {
            pumps.push(self.pump(task.id, OutputStream::Stderr, stderr, Arc::clone(&meta)));
        }

        let entry = WorkerEntry {
            worker_id,
            pid: spawned.pid,
            spawned_at,
            meta: Arc::clone(&meta),
            cancel: cancel.clone(),
            cancel_reason: Arc::clone(&cancel_reason),
        };
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.id, entry);

        self.supervise(task, spawned.child, spawned.pid, cancel, cancel_reason, pumps);

        info!(task_id = %task.id, worker_id = %worker_id, pid = spawned.pid, "worker spawned");
        Ok(WorkerInfo {
            worker_id,
            task_id: task.id,
            pid: spawned.pid,
            spawned_at,
            last_heartbeat: spawned_at,
            status: WorkerStatus::Busy,
        })
    }

    fn pump<R>(
        &self,
        task_id: Uuid,
        stream: OutputStream,
        reader: R,
        meta: Arc<Mutex<WorkerMeta>>,
    ) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        meta.lock().unwrap_or_else(|e| e.into_inner()).last_heartbeat =
                            Utc::now();

                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        // The pipe keeps draining even if a handler drops
                        // the chunk, so the child never blocks on a full
                        // buffer.
                        if let Err(err) = bus
                            .emit(Event::OutputCaptured {
                                task_id,
                                stream,
                                chunk,
                            })
                            .await
                        {
                            warn!(task_id = %task_id, error = %err, "output event emit failed");
                        }
                    }
                    Err(err) => {
                        warn!(task_id = %task_id, ?stream, error = %err, "pump read error");
                        break;
                    }
                }
            }
        })
    }

    fn supervise(
        &self,
        task: &Task,
        mut child: Child,
        pid: u32,
        cancel: CancellationToken,
        cancel_reason: Arc<Mutex<Option<String>>>,
        pumps: Vec<JoinHandle<()>>,
    ) {
        let bus = Arc::clone(&self.bus);
        let monitor = Arc::clone(&self.monitor);
        let spawner = Arc::clone(&self.spawner);
        let workers = Arc::clone(&self.workers);
        let kill_grace = self.kill_grace;
        let task_id = task.id;
        let timeout_ms = task.timeout_ms;
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);

        tokio::spawn(async move {
            enum Outcome {
                Exited(std::io::Result<std::process::ExitStatus>),
                TimedOut,
                Cancelled,
            }

            let outcome = tokio::select! {
                status = child.wait() => Outcome::Exited(status),
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            };

            let terminal = match outcome {
                Outcome::Exited(Ok(status)) => {
                    // A signal death has no code; report -1 like the
                    // recovery path does.
                    let code = status.code().unwrap_or(-1) as i64;
                    if code == 0 {
                        Event::TaskCompleted {
                            task_id,
                            exit_code: 0,
                        }
                    } else {
                        Event::TaskFailed {
                            task_id,
                            exit_code: Some(code),
                            error: format!("process exited with code {code}"),
                        }
                    }
                }
                Outcome::Exited(Err(err)) => Event::TaskFailed {
                    task_id,
                    exit_code: None,
                    error: format!("failed to reap child: {err}"),
                },
                Outcome::TimedOut => {
                    warn!(task_id = %task_id, timeout_ms, "task exceeded its wall-time budget");
                    kill_gracefully(&spawner, &mut child, pid, kill_grace).await;
                    Event::TaskTimeout {
                        task_id,
                        timeout_ms,
                    }
                }
                Outcome::Cancelled => {
                    let exit_code =
                        kill_gracefully(&spawner, &mut child, pid, kill_grace).await;
                    let reason = cancel_reason
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    Event::TaskCancelled {
                        task_id,
                        reason,
                        exit_code: Some(exit_code),
                    }
                }
            };

            // The child is gone, so the pumps see EOF promptly. Drain them
            // before the terminal event so every OutputCaptured precedes it;
            // a grandchild holding the pipe open must not wedge us forever.
            for pump in pumps {
                if tokio::time::timeout(Duration::from_secs(2), pump)
                    .await
                    .is_err()
                {
                    warn!(task_id = %task_id, "output pump did not drain in time");
                }
            }

            workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_id);
            monitor.decrement_worker_count();

            if let Err(err) = bus.emit(terminal).await {
                warn!(task_id = %task_id, error = %err, "terminal event emit failed");
            }
        });
    }

    /// Request cancellation of the worker running a task. Returns whether
    /// such a worker exists; the terminal event arrives asynchronously.
    pub fn kill_task(&self, task_id: Uuid, reason: Option<String>) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        match workers.get(&task_id) {
            Some(entry) => {
                *entry
                    .cancel_reason
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = reason;
                entry.meta.lock().unwrap_or_else(|e| e.into_inner()).status =
                    WorkerStatus::Killed;
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live worker (kernel shutdown).
    pub fn kill_all(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for entry in workers.values() {
            entry.meta.lock().unwrap_or_else(|e| e.into_inner()).status =
                WorkerStatus::Killed;
            entry.cancel.cancel();
        }
    }

    /// The worker currently assigned to a task, if any.
    pub fn worker_for_task(&self, task_id: Uuid) -> Option<WorkerInfo> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.get(&task_id).map(|entry| {
            let meta = entry.meta.lock().unwrap_or_else(|e| e.into_inner());
            WorkerInfo {
                worker_id: entry.worker_id,
                task_id,
                pid: entry.pid,
                spawned_at: entry.spawned_at,
                last_heartbeat: meta.last_heartbeat,
                status: meta.status,
            }
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// SIGTERM, wait out the grace period, SIGKILL if still alive. Returns the
/// observed exit code (-1 when the child died to a signal).
async fn kill_gracefully(
    spawner: &ProcessSpawner,
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> i64 {
    spawner.kill(pid);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1) as i64,
        Ok(Err(_)) => -1,
        Err(_elapsed) => {
            warn!(pid, "child ignored SIGTERM, escalating to SIGKILL");
            let _ = child.kill().await;
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1) as i64,
                Err(_) => -1,
            }
        }
    }
}
