//! Checkpoint handler: snapshots a task's prompt and output tail when it
//! settles, so `resume` can seed a follow-up task.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use offload_db::models::OutputStream;
use offload_db::queries::{checkpoints, outputs, tasks};

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::output::OutputCapture;

use super::{Handler, SubscriptionSet};

/// Chunks of output kept in a checkpoint.
const TAIL_CHUNKS: usize = 20;
/// Byte cap on the stored output tail.
const TAIL_BYTES: usize = 2_000;

pub struct CheckpointHandler {
    pool: SqlitePool,
    capture: Arc<OutputCapture>,
    subscriptions: SubscriptionSet,
}

impl CheckpointHandler {
    pub fn new(pool: SqlitePool, capture: Arc<OutputCapture>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            capture,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event) -> KernelResult<()> {
        let (task_id, exit_code) = match event {
            Event::TaskCompleted { task_id, exit_code } => (task_id, Some(exit_code)),
            Event::TaskFailed {
                task_id, exit_code, ..
            } => (task_id, exit_code),
            Event::TaskCancelled {
                task_id, exit_code, ..
            } => (task_id, exit_code),
            Event::TaskTimeout { task_id, .. } => (task_id, Some(-1)),
            other => {
                debug!(kind = ?other.kind(), "checkpoint handler ignoring event");
                return Ok(());
            }
        };

        let Some(task) = tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
        else {
            return Ok(());
        };

        let tail = self.output_tail(task_id).await;
        if let Err(err) =
            checkpoints::insert_checkpoint(&self.pool, task_id, &task.prompt, exit_code, &tail)
                .await
        {
            // Checkpoints are best-effort; losing one only degrades resume.
            warn!(task_id = %task_id, error = %err, "failed to write checkpoint");
        }
        Ok(())
    }

    /// The last stretch of stdout, from the live buffers when they are
    /// still resident, otherwise from the flushed rows.
    async fn output_tail(&self, task_id: Uuid) -> String {
        let chunks = match self.capture.get_output(task_id, Some(TAIL_CHUNKS)) {
            Some(snapshot) => snapshot.stdout,
            None => outputs::fetch_stream(
                &self.pool,
                task_id,
                OutputStream::Stdout,
                Some(TAIL_CHUNKS as i64),
            )
            .await
            .unwrap_or_default(),
        };

        let mut tail = chunks.concat();
        if tail.len() > TAIL_BYTES {
            let cut = tail.len() - TAIL_BYTES;
            let boundary = (cut..tail.len())
                .find(|i| tail.is_char_boundary(*i))
                .unwrap_or(tail.len());
            tail = tail.split_off(boundary);
        }
        tail
    }
}

#[async_trait]
impl Handler for CheckpointHandler {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    async fn start(self: Arc<Self>, bus: Arc<EventBus>) -> KernelResult<()> {
        for kind in Event::TERMINAL_KINDS {
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
