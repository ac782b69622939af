use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Scheduling priority of a task. `P0` is dispatched before `P1`, `P1`
/// before `P2`; the derived ordering is relied on by the ready queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    P0,
    P1,
    P2,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P0 => "p0",
            Self::P1 => "p1",
            Self::P2 => "p2",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p0" | "P0" => Ok(Self::P0),
            "p1" | "P1" => Ok(Self::P1),
            "p2" | "P2" => Ok(Self::P2),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Aggregate dependency readiness of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyState {
    Ready,
    Blocked,
    UnresolvedFailed,
}

impl fmt::Display for DependencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Blocked => "blocked",
            Self::UnresolvedFailed => "unresolved_failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// How an individual dependency edge was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolution {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for DependencyResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for DependencyResolution {
    type Err = DependencyResolutionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DependencyResolutionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DependencyResolution`] string.
#[derive(Debug, Clone)]
pub struct DependencyResolutionParseError(pub String);

impl fmt::Display for DependencyResolutionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid dependency resolution: {:?}", self.0)
    }
}

impl std::error::Error for DependencyResolutionParseError {}

// ---------------------------------------------------------------------------

/// What to do with a task's worktree branch once the task completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Pr,
    Auto,
    Manual,
    Patch,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pr => "pr",
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Patch => "patch",
        };
        f.write_str(s)
    }
}

impl FromStr for MergeStrategy {
    type Err = MergeStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pr" => Ok(Self::Pr),
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            "patch" => Ok(Self::Patch),
            other => Err(MergeStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MergeStrategy`] string.
#[derive(Debug, Clone)]
pub struct MergeStrategyParseError(pub String);

impl fmt::Display for MergeStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid merge strategy: {:?}", self.0)
    }
}

impl std::error::Error for MergeStrategyParseError {}

// ---------------------------------------------------------------------------

/// Worktree directory cleanup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorktreeCleanup {
    Auto,
    Keep,
    Delete,
}

impl fmt::Display for WorktreeCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Keep => "keep",
            Self::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl FromStr for WorktreeCleanup {
    type Err = WorktreeCleanupParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "keep" => Ok(Self::Keep),
            "delete" => Ok(Self::Delete),
            other => Err(WorktreeCleanupParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorktreeCleanup`] string.
#[derive(Debug, Clone)]
pub struct WorktreeCleanupParseError(pub String);

impl fmt::Display for WorktreeCleanupParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worktree cleanup policy: {:?}", self.0)
    }
}

impl std::error::Error for WorktreeCleanupParseError {}

// ---------------------------------------------------------------------------

/// Kind of schedule: recurring cron expression or a single fixed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Cron,
    OneTime,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cron => "cron",
            Self::OneTime => "one_time",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleType {
    type Err = ScheduleTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(Self::Cron),
            "one_time" => Ok(Self::OneTime),
            other => Err(ScheduleTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleType`] string.
#[derive(Debug, Clone)]
pub struct ScheduleTypeParseError(pub String);

impl fmt::Display for ScheduleTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule type: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Expired,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl FromStr for ScheduleStatus {
    type Err = ScheduleStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(ScheduleStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ScheduleStatus`] string.
#[derive(Debug, Clone)]
pub struct ScheduleStatusParseError(pub String);

impl fmt::Display for ScheduleStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid schedule status: {:?}", self.0)
    }
}

impl std::error::Error for ScheduleStatusParseError {}

// ---------------------------------------------------------------------------

/// What to do when a schedule's slot was missed by more than the grace
/// period (e.g. the daemon was down when the run was due).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    Skip,
    Catchup,
    Fail,
}

impl fmt::Display for MissedRunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skip => "skip",
            Self::Catchup => "catchup",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for MissedRunPolicy {
    type Err = MissedRunPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "catchup" => Ok(Self::Catchup),
            "fail" => Ok(Self::Fail),
            other => Err(MissedRunPolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MissedRunPolicy`] string.
#[derive(Debug, Clone)]
pub struct MissedRunPolicyParseError(pub String);

impl fmt::Display for MissedRunPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid missed-run policy: {:?}", self.0)
    }
}

impl std::error::Error for MissedRunPolicyParseError {}

// ---------------------------------------------------------------------------

/// Outcome of a single schedule trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Triggered,
    Completed,
    Failed,
    Missed,
    Skipped,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Triggered => "triggered",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Missed => "missed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Which child stream a captured chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one requested execution of the delegated agent binary.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub priority: TaskPriority,
    pub working_directory: String,
    pub status: TaskStatus,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    /// Root of the retry chain; equals `id` for a first attempt.
    pub parent_task_id: Uuid,
    /// Immediate predecessor in the retry chain, if any.
    pub retry_of: Option<Uuid>,
    /// Tasks this one waits on. Derived from the edge table, not a column;
    /// populated where callers need it.
    #[sqlx(skip)]
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub dependency_state: DependencyState,
    pub use_worktree: bool,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub worktree_cleanup: WorktreeCleanup,
    pub auto_commit: bool,
    pub push_to_remote: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub timeout_ms: i64,
    pub max_output_buffer_bytes: i64,
    /// Task whose latest checkpoint seeded this task's prompt.
    pub continue_from: Option<Uuid>,
}

/// An edge in the task dependency DAG: `task_id` waits on
/// `depends_on_task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub id: Uuid,
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: DependencyResolution,
}

/// One persisted chunk of a task's captured output.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskOutputChunk {
    pub task_id: Uuid,
    pub stream: OutputStream,
    pub chunk_index: i64,
    pub data: String,
}

/// A schedule -- a task template plus the recurrence that materializes it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Schedule {
    pub id: String,
    /// Serialized delegate request used to materialize each run.
    pub task_template: String,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// IANA zone in which cron occurrences are computed.
    pub timezone: String,
    pub missed_run_policy: MissedRunPolicy,
    pub status: ScheduleStatus,
    pub max_runs: Option<i64>,
    pub run_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Chaining target: runs of this schedule depend on the most recent
    /// task triggered by the named schedule, when that task is still live.
    pub after_schedule_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit record for one trigger attempt of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleExecution {
    pub id: Uuid,
    pub schedule_id: String,
    pub task_id: Option<Uuid>,
    pub scheduled_for: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
}

/// A checkpoint snapshot taken when a task reaches a terminal state,
/// used to seed the prompt of a resumed task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskCheckpoint {
    pub id: i64,
    pub task_id: Uuid,
    pub prompt: String,
    pub exit_code: Option<i64>,
    pub output_tail: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        let result = "bogus".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn priority_ordering_drives_dispatch() {
        assert!(TaskPriority::P0 < TaskPriority::P1);
        assert!(TaskPriority::P1 < TaskPriority::P2);
    }

    #[test]
    fn priority_parses_either_case() {
        assert_eq!("p0".parse::<TaskPriority>().unwrap(), TaskPriority::P0);
        assert_eq!("P1".parse::<TaskPriority>().unwrap(), TaskPriority::P1);
        assert!("p3".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn dependency_resolution_display_roundtrip() {
        let variants = [
            DependencyResolution::Pending,
            DependencyResolution::Completed,
            DependencyResolution::Failed,
            DependencyResolution::Cancelled,
        ];
        for v in &variants {
            let parsed: DependencyResolution = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn merge_strategy_display_roundtrip() {
        let variants = [
            MergeStrategy::Pr,
            MergeStrategy::Auto,
            MergeStrategy::Manual,
            MergeStrategy::Patch,
        ];
        for v in &variants {
            let parsed: MergeStrategy = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn schedule_status_display_roundtrip() {
        let variants = [
            ScheduleStatus::Active,
            ScheduleStatus::Paused,
            ScheduleStatus::Completed,
            ScheduleStatus::Cancelled,
            ScheduleStatus::Expired,
        ];
        for v in &variants {
            let parsed: ScheduleStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn missed_run_policy_invalid() {
        assert!("retry".parse::<MissedRunPolicy>().is_err());
    }

    #[test]
    fn schedule_type_underscore_form() {
        assert_eq!(
            "one_time".parse::<ScheduleType>().unwrap(),
            ScheduleType::OneTime
        );
        assert!("once".parse::<ScheduleType>().is_err());
    }
}
