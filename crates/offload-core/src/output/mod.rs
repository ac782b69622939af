//! In-memory capture of child stdout/stderr.
//!
//! Each running task owns a pair of chunk lists with a shared byte budget.
//! A chunk that would push the total over the task's limit is rejected
//! whole; the buffer is never left with a partial write. Byte accounting
//! uses UTF-8 byte length, not character count.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use offload_db::models::OutputStream;

use crate::error::{ErrorCode, KernelError, KernelResult};

/// Frozen copy of a task's captured output.
#[derive(Debug, Clone, Default)]
pub struct TaskOutputSnapshot {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub total_bytes: u64,
}

struct TaskBuffers {
    limit: u64,
    total: u64,
    stdout: Vec<String>,
    stderr: Vec<String>,
    completed: bool,
}

#[derive(Default)]
struct CaptureInner {
    buffers: HashMap<Uuid, TaskBuffers>,
    /// Completed tasks in completion order, oldest first, for LRU eviction.
    completed_order: VecDeque<Uuid>,
}

/// Holds the live output buffers of every task the kernel knows about.
pub struct OutputCapture {
    inner: Mutex<CaptureInner>,
    /// How many completed-task buffers stay resident before eviction.
    retention: usize,
}

impl OutputCapture {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(CaptureInner::default()),
            retention,
        }
    }

    /// Create the buffer pair for a task with its byte limit. Re-registering
    /// an existing task resets nothing; the call is ignored.
    pub fn register(&self, task_id: Uuid, limit_bytes: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.buffers.entry(task_id).or_insert(TaskBuffers {
            limit: limit_bytes,
            total: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            completed: false,
        });
    }

    /// Append one chunk to a task's stream.
    ///
    /// Rejects the whole chunk with `OUTPUT_BUFFER_LIMIT_EXCEEDED` when it
    /// would overflow the task's budget, leaving the buffer untouched. The
    /// task keeps running; the caller decides what to do about the loss.
    pub fn append(&self, task_id: Uuid, stream: OutputStream, chunk: String) -> KernelResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = inner
            .buffers
            .get_mut(&task_id)
            .ok_or_else(|| KernelError::task_not_found(task_id))?;

        let chunk_bytes = chunk.len() as u64;
        if buffers.total + chunk_bytes > buffers.limit {
            return Err(KernelError::new(
                ErrorCode::OutputBufferLimitExceeded,
                format!(
                    "chunk of {chunk_bytes} bytes would exceed the {} byte budget",
                    buffers.limit
                ),
            )
            .with_context("task_id", task_id.to_string())
            .with_context("buffered_bytes", buffers.total.to_string()));
        }

        buffers.total += chunk_bytes;
        match stream {
            OutputStream::Stdout => buffers.stdout.push(chunk),
            OutputStream::Stderr => buffers.stderr.push(chunk),
        }
        Ok(())
    }

    /// Frozen copy of a task's output. With `tail = Some(n)`, only the
    /// last `n` chunks of each stream are returned; `total_bytes` always
    /// reflects the full buffer.
    pub fn get_output(&self, task_id: Uuid, tail: Option<usize>) -> Option<TaskOutputSnapshot> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = inner.buffers.get(&task_id)?;

        let slice = |chunks: &Vec<String>| -> Vec<String> {
            match tail {
                Some(n) if n > 0 && n < chunks.len() => chunks[chunks.len() - n..].to_vec(),
                _ => chunks.clone(),
            }
        };

        Some(TaskOutputSnapshot {
            stdout: slice(&buffers.stdout),
            stderr: slice(&buffers.stderr),
            total_bytes: buffers.total,
        })
    }

    /// Whether a task still has buffers resident.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buffers
            .contains_key(&task_id)
    }

    /// Mark a task's buffers as belonging to a finished task and evict the
    /// oldest completed buffers beyond the retention count. Buffers of
    /// active tasks are never evicted.
    pub fn mark_completed(&self, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(buffers) = inner.buffers.get_mut(&task_id) {
            if !buffers.completed {
                buffers.completed = true;
                inner.completed_order.push_back(task_id);
            }
        }

        while inner.completed_order.len() > self.retention {
            if let Some(oldest) = inner.completed_order.pop_front() {
                inner.buffers.remove(&oldest);
            }
        }
    }

    /// Remove and return a task's buffers, e.g. for the flush to the store.
    pub fn take(&self, task_id: Uuid) -> Option<TaskOutputSnapshot> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let buffers = inner.buffers.get(&task_id)?;
        // Clone rather than remove: the snapshot may still be served to
        // status queries until LRU eviction drops it.
        Some(TaskOutputSnapshot {
            stdout: buffers.stdout.clone(),
            stderr: buffers.stderr.clone(),
            total_bytes: buffers.total,
        })
    }

    /// Drop a task's buffers outright.
    pub fn release(&self, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.buffers.remove(&task_id);
        inner.completed_order.retain(|id| *id != task_id);
    }
}
