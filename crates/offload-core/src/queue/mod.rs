//! Priority-ordered ready queue.
//!
//! Keyed by (priority, created_at, id): P0 drains before P1 before P2, and
//! within a priority the oldest task goes first. The queue is advisory and
//! purely in-memory; the store is the durable record, and on restart the
//! recovery manager rebuilds the queue from status=queued rows.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use offload_db::models::{Task, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    task_id: Uuid,
}

#[derive(Default)]
struct QueueInner {
    ordered: BTreeSet<QueueKey>,
    by_id: HashMap<Uuid, QueueKey>,
}

/// The ready queue. All operations take the internal mutex for the span of
/// a single call.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if it is already queued.
    pub fn enqueue(&self, task: &Task) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.by_id.contains_key(&task.id) {
            return false;
        }
        let key = QueueKey {
            priority: task.priority,
            created_at: task.created_at,
            task_id: task.id,
        };
        inner.ordered.insert(key);
        inner.by_id.insert(task.id, key);
        true
    }

    /// Remove and return the highest-priority ready task id.
    pub fn dequeue(&self) -> Option<Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = *inner.ordered.first()?;
        inner.ordered.remove(&key);
        inner.by_id.remove(&key.task_id);
        Some(key.task_id)
    }

    /// The id that `dequeue` would return, without removing it.
    pub fn peek(&self) -> Option<Uuid> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ordered.first().map(|key| key.task_id)
    }

    /// Remove a specific task. Returns whether it was present.
    pub fn remove(&self, task_id: Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.by_id.remove(&task_id) {
            Some(key) => {
                inner.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.ordered.clear();
        inner.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use offload_test_utils::sample_task;

    fn task_with(priority: TaskPriority, age_ms: i64) -> Task {
        let mut task = sample_task("x");
        task.priority = priority;
        task.created_at = Utc::now() - Duration::milliseconds(age_ms);
        task
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let queue = TaskQueue::new();
        let low = task_with(TaskPriority::P2, 100);
        let high = task_with(TaskPriority::P0, 0);
        let mid = task_with(TaskPriority::P1, 50);

        queue.enqueue(&low);
        queue.enqueue(&high);
        queue.enqueue(&mid);

        assert_eq!(queue.dequeue(), Some(high.id));
        assert_eq!(queue.dequeue(), Some(mid.id));
        assert_eq!(queue.dequeue(), Some(low.id));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn fifo_within_a_priority() {
        let queue = TaskQueue::new();
        let older = task_with(TaskPriority::P2, 1_000);
        let newer = task_with(TaskPriority::P2, 10);

        queue.enqueue(&newer);
        queue.enqueue(&older);

        assert_eq!(queue.dequeue(), Some(older.id));
        assert_eq!(queue.dequeue(), Some(newer.id));
    }

    #[test]
    fn enqueue_is_idempotent() {
        let queue = TaskQueue::new();
        let task = task_with(TaskPriority::P1, 0);

        assert!(queue.enqueue(&task));
        assert!(!queue.enqueue(&task));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_reports_presence() {
        let queue = TaskQueue::new();
        let task = task_with(TaskPriority::P1, 0);
        queue.enqueue(&task);

        assert!(queue.contains(task.id));
        assert!(queue.remove(task.id));
        assert!(!queue.remove(task.id));
        assert!(!queue.contains(task.id));
        assert!(queue.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = TaskQueue::new();
        let task = task_with(TaskPriority::P0, 0);
        queue.enqueue(&task);

        assert_eq!(queue.peek(), Some(task.id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue(), Some(task.id));
    }

    #[test]
    fn clear_empties_everything() {
        let queue = TaskQueue::new();
        for _ in 0..3 {
            queue.enqueue(&task_with(TaskPriority::P2, 0));
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }
}
