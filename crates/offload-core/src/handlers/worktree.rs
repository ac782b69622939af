//! Worktree handler: applies a task's merge strategy once it settles.
//!
//! Everything here is best-effort. A failed merge or cleanup never fails
//! the task — the work exists on the branch either way, and the logs say
//! what happened.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use offload_db::models::{MergeStrategy, Task, WorktreeCleanup};
use offload_db::queries::tasks;

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventBus, EventKind, handler};
use crate::worktree::{MergeResult, WorktreeManager};

use super::{Handler, SubscriptionSet};

pub struct WorktreeHandler {
    pool: SqlitePool,
    /// Where `patch`-strategy diffs are written.
    patch_dir: PathBuf,
    subscriptions: SubscriptionSet,
}

impl WorktreeHandler {
    pub fn new(pool: SqlitePool, patch_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            pool,
            patch_dir,
            subscriptions: SubscriptionSet::new(),
        })
    }

    async fn handle(&self, event: Event) -> KernelResult<()> {
        let (task_id, succeeded) = match event {
            Event::TaskCompleted { task_id, .. } => (task_id, true),
            Event::TaskFailed { task_id, .. }
            | Event::TaskCancelled { task_id, .. }
            | Event::TaskTimeout { task_id, .. } => (task_id, false),
            other => {
                debug!(kind = ?other.kind(), "worktree handler ignoring event");
                return Ok(());
            }
        };

        let Some(task) = tasks::get_task(&self.pool, task_id)
            .await
            .map_err(KernelError::from)?
        else {
            return Ok(());
        };
        if !task.use_worktree {
            return Ok(());
        }

        let manager = match WorktreeManager::new(&task.working_directory, None) {
            Ok(manager) => manager,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "cannot open repository for worktree finish");
                return Ok(());
            }
        };

        if succeeded {
            self.finish_success(&manager, &task);
        } else {
            self.finish_failure(&manager, &task);
        }
        Ok(())
    }

    fn branch_and_path(manager: &WorktreeManager, task: &Task) -> (String, PathBuf) {
        let branch = task
            .branch
            .clone()
            .unwrap_or_else(|| WorktreeManager::branch_name(task.id));
        let path = manager.worktree_path(&branch);
        (branch, path)
    }

    fn finish_success(&self, manager: &WorktreeManager, task: &Task) {
        let (branch, worktree_path) = Self::branch_and_path(manager, task);

        if task.auto_commit {
            match manager.commit_all(&worktree_path, &format!("offload task {}", task.id)) {
                Ok(true) => info!(task_id = %task.id, "committed task work on {branch}"),
                Ok(false) => debug!(task_id = %task.id, "no changes to commit"),
                Err(err) => warn!(task_id = %task.id, error = %err, "failed to commit task work"),
            }
        }

        if task.push_to_remote {
            if let Err(err) = manager.push_branch(&branch) {
                warn!(task_id = %task.id, error = %err, "failed to push task branch");
            }
        }

        match task.merge_strategy {
            MergeStrategy::Auto => match manager.merge_branch(&branch) {
                Ok(MergeResult::Merged) => {
                    info!(task_id = %task.id, "merged {branch}");
                    self.cleanup(manager, task, &branch, &worktree_path, true);
                }
                Ok(MergeResult::Conflict { details }) => {
                    warn!(
                        task_id = %task.id,
                        "merge of {branch} hit conflicts, branch kept for manual resolution: {details}"
                    );
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "merge of {branch} failed");
                }
            },
            MergeStrategy::Patch => {
                let base = task.base_branch.as_deref().unwrap_or("HEAD");
                let out = self.patch_dir.join(format!("task-{}.patch", task.id));
                match manager.write_patch(&branch, base, &out) {
                    Ok(()) => info!(task_id = %task.id, patch = %out.display(), "wrote patch"),
                    Err(err) => warn!(task_id = %task.id, error = %err, "failed to write patch"),
                }
                self.cleanup(manager, task, &branch, &worktree_path, false);
            }
            MergeStrategy::Pr | MergeStrategy::Manual => {
                // The branch is the artifact; opening a PR is the caller's
                // business. Record intent in the log and leave it be.
                info!(
                    task_id = %task.id,
                    branch = %branch,
                    strategy = %task.merge_strategy,
                    "task branch ready"
                );
                self.cleanup(manager, task, &branch, &worktree_path, false);
            }
        }
    }

    fn finish_failure(&self, manager: &WorktreeManager, task: &Task) {
        let (branch, worktree_path) = Self::branch_and_path(manager, task);
        match task.worktree_cleanup {
            WorktreeCleanup::Keep => {
                info!(task_id = %task.id, "keeping worktree of unsuccessful task for inspection");
            }
            WorktreeCleanup::Auto => {
                // Drop the directory, keep the branch for forensics.
                if let Err(err) = manager.remove_worktree(&worktree_path) {
                    warn!(task_id = %task.id, error = %err, "failed to remove worktree");
                }
            }
            WorktreeCleanup::Delete => {
                if let Err(err) = manager.remove_worktree(&worktree_path) {
                    warn!(task_id = %task.id, error = %err, "failed to remove worktree");
                }
                if let Err(err) = manager.delete_branch(&branch) {
                    warn!(task_id = %task.id, error = %err, "failed to delete branch");
                }
            }
        }
    }

    /// Post-success cleanup. `merged` allows branch deletion under the
    /// `auto` policy; an unmerged branch is only deleted when explicitly
    /// asked for.
    fn cleanup(
        &self,
        manager: &WorktreeManager,
        task: &Task,
        branch: &str,
        worktree_path: &std::path::Path,
        merged: bool,
    ) {
        match task.worktree_cleanup {
            WorktreeCleanup::Keep => {}
            WorktreeCleanup::Auto => {
                if let Err(err) = manager.remove_worktree(worktree_path) {
                    warn!(task_id = %task.id, error = %err, "failed to remove worktree");
                }
                if merged {
                    if let Err(err) = manager.delete_branch(branch) {
                        warn!(task_id = %task.id, error = %err, "failed to delete merged branch");
                    }
                }
            }
            WorktreeCleanup::Delete => {
                if let Err(err) = manager.remove_worktree(worktree_path) {
                    warn!(task_id = %task.id, error = %err, "failed to remove worktree");
                }
                if let Err(err) = manager.delete_branch(branch) {
                    warn!(task_id = %task.id, error = %err, "failed to delete branch");
                }
            }
        }
    }

}

#[async_trait]
impl Handler for WorktreeHandler {
    fn name(&self) -> &'static str {
        "worktree"
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
