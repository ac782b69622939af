//! The kernel's event vocabulary.
//!
//! Every state transition in the system travels as one of these variants,
//! so the compiler enforces exhaustive handling wherever events are
//! consumed. Query variants carry a correlation id that ties them to a
//! single-shot response channel held by the bus.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use offload_db::models::{OutputStream, Task};

use crate::monitor::ResourceSnapshot;
use crate::output::TaskOutputSnapshot;

/// A typed event on the kernel bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A validated task has been handed to the kernel.
    TaskDelegated { task: Task },
    /// The task row is durably saved.
    TaskPersisted { task: Task },
    /// The task entered the ready queue.
    TaskQueued { task_id: Uuid },
    /// A worker slot was claimed; the store is about to mark it running.
    TaskStarting { task_id: Uuid },
    /// The child process is alive.
    TaskStarted { task_id: Uuid, pid: u32 },
    /// One chunk of child output was captured.
    OutputCaptured {
        task_id: Uuid,
        stream: OutputStream,
        chunk: String,
    },
    /// The child exited with code zero.
    TaskCompleted { task_id: Uuid, exit_code: i64 },
    /// The child exited non-zero, or the task failed without running.
    TaskFailed {
        task_id: Uuid,
        exit_code: Option<i64>,
        error: String,
    },
    /// The task was cancelled; `exit_code` is absent when it never ran.
    TaskCancelled {
        task_id: Uuid,
        reason: Option<String>,
        exit_code: Option<i64>,
    },
    /// The task exceeded its wall-time budget and was killed.
    TaskTimeout { task_id: Uuid, timeout_ms: i64 },
    /// A caller asked for the task to be cancelled.
    TaskCancellationRequested {
        task_id: Uuid,
        reason: Option<String>,
    },
    /// The last unresolved dependency of this task completed. Carries the
    /// task so the queue handler need not re-read the store.
    TaskUnblocked { task: Task },
    /// Fresh host metrics from the resource monitor.
    SystemResourcesUpdated { snapshot: ResourceSnapshot },
    /// Correlated query: one task by id, or all tasks when `task_id` is
    /// absent.
    TaskStatusQuery {
        correlation_id: Uuid,
        task_id: Option<Uuid>,
    },
    /// Correlated query: captured output of one task.
    TaskLogsQuery {
        correlation_id: Uuid,
        task_id: Uuid,
        tail: Option<usize>,
    },
    /// A schedule slot fired; the schedule handler materializes the task.
    ScheduleTriggered {
        schedule_id: String,
        scheduled_for: DateTime<Utc>,
    },
    /// A schedule slot was overdue past the grace period.
    ScheduleMissed {
        schedule_id: String,
        scheduled_for: DateTime<Utc>,
    },
    /// Startup reconciliation finished.
    RecoveryCompleted { requeued: usize, failed: usize },
}

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskDelegated,
    TaskPersisted,
    TaskQueued,
    TaskStarting,
    TaskStarted,
    OutputCaptured,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimeout,
    TaskCancellationRequested,
    TaskUnblocked,
    SystemResourcesUpdated,
    TaskStatusQuery,
    TaskLogsQuery,
    ScheduleTriggered,
    ScheduleMissed,
    RecoveryCompleted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TaskDelegated { .. } => EventKind::TaskDelegated,
            Self::TaskPersisted { .. } => EventKind::TaskPersisted,
            Self::TaskQueued { .. } => EventKind::TaskQueued,
            Self::TaskStarting { .. } => EventKind::TaskStarting,
            Self::TaskStarted { .. } => EventKind::TaskStarted,
            Self::OutputCaptured { .. } => EventKind::OutputCaptured,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskCancelled { .. } => EventKind::TaskCancelled,
            Self::TaskTimeout { .. } => EventKind::TaskTimeout,
            Self::TaskCancellationRequested { .. } => EventKind::TaskCancellationRequested,
            Self::TaskUnblocked { .. } => EventKind::TaskUnblocked,
            Self::SystemResourcesUpdated { .. } => EventKind::SystemResourcesUpdated,
            Self::TaskStatusQuery { .. } => EventKind::TaskStatusQuery,
            Self::TaskLogsQuery { .. } => EventKind::TaskLogsQuery,
            Self::ScheduleTriggered { .. } => EventKind::ScheduleTriggered,
            Self::ScheduleMissed { .. } => EventKind::ScheduleMissed,
            Self::RecoveryCompleted { .. } => EventKind::RecoveryCompleted,
        }
    }

    /// The correlation id of a query event, if this is one.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskStatusQuery { correlation_id, .. }
            | Self::TaskLogsQuery { correlation_id, .. } => Some(*correlation_id),
            _ => None,
        }
    }

    /// The terminal event kinds of a task, in the order they may appear
    /// in handler subscription lists.
    pub const TERMINAL_KINDS: [EventKind; 4] = [
        EventKind::TaskCompleted,
        EventKind::TaskFailed,
        EventKind::TaskCancelled,
        EventKind::TaskTimeout,
    ];
}

/// Payload delivered back through the bus's correlation map.
#[derive(Debug, Clone)]
pub enum QueryResponse {
    Status(Vec<Task>),
    Logs(TaskOutputSnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let ev = Event::TaskQueued {
            task_id: Uuid::new_v4(),
        };
        assert_eq!(ev.kind(), EventKind::TaskQueued);
    }

    #[test]
    fn only_queries_carry_correlation_ids() {
        let id = Uuid::new_v4();
        let query = Event::TaskStatusQuery {
            correlation_id: id,
            task_id: None,
        };
        assert_eq!(query.correlation_id(), Some(id));

        let plain = Event::RecoveryCompleted {
            requeued: 0,
            failed: 0,
        };
        assert_eq!(plain.correlation_id(), None);
    }
}
