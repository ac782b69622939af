//! Front-door API for task operations.
//!
//! The manager validates and normalizes requests, constructs domain
//! objects, and talks to the rest of the kernel exclusively through the
//! bus: commands as emitted events, reads as correlated requests. The one
//! direct store access is checkpoint seeding for `continue_from`/`resume`.

use std::path::{Component, Path};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use offload_db::models::{
    DependencyState, MergeStrategy, Task, TaskCheckpoint, TaskPriority, TaskStatus,
    WorktreeCleanup,
};
use offload_db::queries::{checkpoints, tasks};

use crate::config::{KernelConfig, MAX_PROMPT_BYTES};
use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::events::{Event, EventBus, QueryResponse};
use crate::output::TaskOutputSnapshot;
use crate::queue::TaskQueue;
use crate::worktree::WorktreeManager;

/// A request to delegate one task. This is also the shape serialized into
/// schedule templates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DelegateRequest {
    pub prompt: String,
    pub priority: Option<TaskPriority>,
    pub working_directory: String,
    pub use_worktree: bool,
    pub worktree_cleanup: Option<WorktreeCleanup>,
    pub merge_strategy: Option<MergeStrategy>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub auto_commit: bool,
    pub push_to_remote: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub timeout_ms: Option<i64>,
    pub max_output_buffer_bytes: Option<i64>,
    pub depends_on: Vec<Uuid>,
    pub continue_from: Option<Uuid>,
}

/// Check request shape and ranges. Directory problems get their own code
/// so adapters can distinguish a typo'd path from a malformed request.
pub fn validate_request(request: &DelegateRequest, _config: &KernelConfig) -> KernelResult<()> {
    let prompt_bytes = request.prompt.len();
    if prompt_bytes == 0 {
        return Err(KernelError::validation("prompt must not be empty"));
    }
    if prompt_bytes > MAX_PROMPT_BYTES {
        return Err(KernelError::validation(format!(
            "prompt is {prompt_bytes} bytes, maximum is {MAX_PROMPT_BYTES}"
        ))
        .with_context("limit", MAX_PROMPT_BYTES.to_string()));
    }

    let dir = Path::new(&request.working_directory);
    if !dir.is_absolute() {
        return Err(KernelError::invalid_directory(format!(
            "working directory must be absolute, got {:?}",
            request.working_directory
        )));
    }
    if dir.components().any(|c| c == Component::ParentDir) {
        return Err(KernelError::invalid_directory(
            "working directory must not contain '..'",
        ));
    }
    if !dir.is_dir() {
        return Err(KernelError::invalid_directory(format!(
            "working directory {:?} does not exist",
            request.working_directory
        )));
    }

    Ok(())
}

/// Construct a queued task from a validated request, applying defaults and
/// clamps.
pub fn build_task(request: &DelegateRequest, config: &KernelConfig) -> Task {
    let id = Uuid::new_v4();
    let mut depends_on = request.depends_on.clone();
    depends_on.dedup();

    let dependency_state = if depends_on.is_empty() {
        DependencyState::Ready
    } else {
        DependencyState::Blocked
    };

    let branch = request.use_worktree.then(|| {
        request
            .branch_name
            .clone()
            .unwrap_or_else(|| WorktreeManager::branch_name(id))
    });

    Task {
        id,
        prompt: request.prompt.clone(),
        priority: request.priority.unwrap_or(TaskPriority::P2),
        working_directory: request.working_directory.clone(),
        status: TaskStatus::Queued,
        exit_code: None,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        retry_count: 0,
        parent_task_id: id,
        retry_of: None,
        depends_on,
        dependency_state,
        use_worktree: request.use_worktree,
        branch,
        base_branch: request.base_branch.clone(),
        merge_strategy: request.merge_strategy.unwrap_or(MergeStrategy::Manual),
        worktree_cleanup: request.worktree_cleanup.unwrap_or(WorktreeCleanup::Auto),
        auto_commit: request.auto_commit,
        push_to_remote: request.push_to_remote,
        pr_title: request.pr_title.clone(),
        pr_body: request.pr_body.clone(),
        timeout_ms: config.clamp_timeout_ms(request.timeout_ms),
        max_output_buffer_bytes: config.clamp_buffer_bytes(request.max_output_buffer_bytes),
        continue_from: request.continue_from,
    }
}

/// The front door.
pub struct TaskManager {
    bus: Arc<EventBus>,
    pool: SqlitePool,
    queue: Arc<TaskQueue>,
    config: Arc<KernelConfig>,
}

impl TaskManager {
    pub fn new(
        bus: Arc<EventBus>,
        pool: SqlitePool,
        queue: Arc<TaskQueue>,
        config: Arc<KernelConfig>,
    ) -> Self {
        Self {
            bus,
            pool,
            queue,
            config,
        }
    }

    /// Submit a new task. Returns the constructed task, already queued (or
    /// blocked on its dependencies).
    pub async fn delegate(&self, mut request: DelegateRequest) -> KernelResult<Task> {
        validate_request(&request, &self.config)?;

        if self.queue.len() >= self.config.max_queued_tasks {
            return Err(KernelError::new(
                ErrorCode::ResourceExhausted,
                format!(
                    "queue holds {} tasks, limit is {}",
                    self.queue.len(),
                    self.config.max_queued_tasks
                ),
            ));
        }

        if let Some(source) = request.continue_from {
            let checkpoint = self.require_checkpoint_source(source).await?;
            request.prompt = seeded_prompt(&request.prompt, checkpoint.as_ref(), None);
        }

        let task = build_task(&request, &self.config);
        self.emit_delegated(task).await
    }

    /// One task by id, or the latest tasks when `task_id` is absent.
    pub async fn get_status(&self, task_id: Option<Uuid>) -> KernelResult<Vec<Task>> {
        let response = self
            .bus
            .request(Event::TaskStatusQuery {
                correlation_id: Uuid::new_v4(),
                task_id,
            })
            .await
            .map_err(map_business_error)?;
        match response {
            QueryResponse::Status(tasks) => Ok(tasks),
            QueryResponse::Logs(_) => Err(KernelError::system("mismatched query response")),
        }
    }

    /// Captured output of a task. `tail` is clamped to 1..=1000 chunks,
    /// defaulting to 100.
    pub async fn get_logs(
        &self,
        task_id: Uuid,
        tail: Option<usize>,
    ) -> KernelResult<TaskOutputSnapshot> {
        let tail = tail.unwrap_or(100).clamp(1, 1_000);
        let response = self
            .bus
            .request(Event::TaskLogsQuery {
                correlation_id: Uuid::new_v4(),
                task_id,
                tail: Some(tail),
            })
            .await
            .map_err(map_business_error)?;
        match response {
            QueryResponse::Logs(snapshot) => Ok(snapshot),
            QueryResponse::Status(_) => Err(KernelError::system("mismatched query response")),
        }
    }

    /// Request cancellation. Terminal tasks report `TASK_CANNOT_CANCEL`.
    pub async fn cancel(&self, task_id: Uuid, reason: Option<String>) -> KernelResult<()> {
        self.bus
            .emit(Event::TaskCancellationRequested { task_id, reason })
            .await
            .map_err(map_business_error)?;
        Ok(())
    }

    /// Re-run a settled task with its original configuration. The new task
    /// extends the retry chain.
    pub async fn retry(&self, task_id: Uuid) -> KernelResult<Task> {
        let original = self.require_terminal(task_id, "retry").await?;
        let task = follow_up_task(&original, original.prompt.clone(), None);
        self.emit_delegated(task).await
    }

    /// Like retry, but the new prompt is seeded from the latest checkpoint
    /// plus optional caller-provided context.
    pub async fn resume(&self, task_id: Uuid, context: Option<String>) -> KernelResult<Task> {
        let original = self.require_terminal(task_id, "resume").await?;

        let checkpoint = checkpoints::latest_checkpoint(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?;
        let prompt = seeded_prompt(&original.prompt, checkpoint.as_ref(), context.as_deref());

        let task = follow_up_task(&original, prompt, Some(task_id));
        self.emit_delegated(task).await
    }

    async fn emit_delegated(&self, task: Task) -> KernelResult<Task> {
        info!(task_id = %task.id, priority = %task.priority, "delegating task");
        self.bus
            .emit(Event::TaskDelegated { task: task.clone() })
            .await
            .map_err(map_business_error)?;
        Ok(task)
    }

    async fn require_terminal(&self, task_id: Uuid, verb: &str) -> KernelResult<Task> {
        let mut found = self.get_status(Some(task_id)).await?;
        let original = found
            .pop()
            .ok_or_else(|| KernelError::task_not_found(task_id))?;
        if !original.status.is_terminal() {
            return Err(KernelError::invalid_operation(format!(
                "cannot {verb} task {task_id} while it is {}",
                original.status
            )));
        }
        Ok(original)
    }

    async fn require_checkpoint_source(
        &self,
        source: Uuid,
    ) -> KernelResult<Option<TaskCheckpoint>> {
        tasks::get_task(&self.pool, source)
            .await
            .map_err(KernelError::from)?
            .ok_or_else(|| KernelError::task_not_found(source))?;
        checkpoints::latest_checkpoint(&self.pool, source)
            .await
            .map_err(KernelError::from)
    }
}

/// Build the next link of a retry chain from a settled task.
fn follow_up_task(original: &Task, prompt: String, continue_from: Option<Uuid>) -> Task {
    let id = Uuid::new_v4();
    Task {
        id,
        prompt,
        status: TaskStatus::Queued,
        exit_code: None,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        retry_count: original.retry_count + 1,
        parent_task_id: original.parent_task_id,
        retry_of: Some(original.id),
        depends_on: original.depends_on.clone(),
        dependency_state: if original.depends_on.is_empty() {
            DependencyState::Ready
        } else {
            DependencyState::Blocked
        },
        // A fresh branch per attempt; the old one stays as history.
        branch: original
            .use_worktree
            .then(|| WorktreeManager::branch_name(id)),
        continue_from,
        ..original.clone()
    }
}

/// Compose the prompt of a continued task: prior prompt, prior exit state,
/// output tail, then the new instruction. Kept within the prompt budget by
/// shrinking the tail first.
fn seeded_prompt(
    instruction: &str,
    checkpoint: Option<&TaskCheckpoint>,
    context: Option<&str>,
) -> String {
    let Some(checkpoint) = checkpoint else {
        return match context {
            Some(context) => format!("{instruction}\n\nAdditional context:\n{context}"),
            None => instruction.to_string(),
        };
    };

    let exit_note = match checkpoint.exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    };
    let context_block = context
        .map(|c| format!("\n\nAdditional context:\n{c}"))
        .unwrap_or_default();

    let frame = format!(
        "Continue an earlier task.\n\nEarlier prompt:\n{}\n\nIt ended with {exit_note}. \
         Last output:\n<<TAIL>>{context_block}\n\n{instruction}",
        checkpoint.prompt
    );

    let budget = MAX_PROMPT_BYTES.saturating_sub(frame.len() - "<<TAIL>>".len());
    let tail = truncate_to_bytes(&checkpoint.output_tail, budget);
    let seeded = frame.replace("<<TAIL>>", tail);
    truncate_to_bytes(&seeded, MAX_PROMPT_BYTES).to_string()
}

/// Longest prefix of `s` that fits in `limit` bytes on a char boundary.
fn truncate_to_bytes(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Surface the most relevant business failure buried in an aggregate emit
/// error.
fn map_business_error(err: KernelError) -> KernelError {
    const PRIORITY: [ErrorCode; 9] = [
        ErrorCode::DependencyCycle,
        ErrorCode::TaskNotFound,
        ErrorCode::TaskCannotCancel,
        ErrorCode::InvalidOperation,
        ErrorCode::Validation,
        ErrorCode::InvalidDirectory,
        ErrorCode::ResourceExhausted,
        ErrorCode::RequestTimeout,
        ErrorCode::StorageFailure,
    ];
    for code in PRIORITY {
        if let Some(found) = err.find_code(code) {
            return found.clone();
        }
    }
    err
}
