//! Git worktree capability for isolated task execution.
//!
//! A task that opts in runs on its own branch in its own worktree. The
//! worktree shares the repository's object store, so creation is cheap,
//! but git serialises worktree mutations through a lock file on that
//! store; the manager mirrors this with an internal mutex around every
//! mutating operation.
//!
//! Every git invocation funnels through one runner, so failures carry the
//! command line and stderr uniformly.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use uuid::Uuid;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The configured repository path is not a git repository.
    #[error("not a git repository: {}", .0.display())]
    NotAGitRepo(PathBuf),

    /// A git invocation could not run or exited non-zero.
    #[error("git {command} failed: {detail}")]
    Git { command: String, detail: String },

    /// The expected worktree directory holds a different branch.
    #[error("worktree at {} is on branch {found:?}, expected {expected:?}", .path.display())]
    WrongBranch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Filesystem trouble around the worktree base directory.
    #[error("worktree io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of merging a task branch back into the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Merged,
    /// The merge was aborted on conflicts; the branch survives for manual
    /// resolution.
    Conflict { details: String },
}

/// Creates, finishes, and disposes of per-task worktrees for one
/// repository.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo: PathBuf,
    base: PathBuf,
    git_lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Open a manager for the repository at `repo`. Worktrees are created
    /// under `base`, defaulting to `<repo-name>-offload-worktrees` next to
    /// the repository.
    pub fn new(repo: impl Into<PathBuf>, base: Option<PathBuf>) -> Result<Self, WorktreeError> {
        let repo = repo.into();

        // rev-parse is the cheapest probe for "is this a repository".
        let is_repo = run_git(&repo, &["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false);
        if !is_repo {
            return Err(WorktreeError::NotAGitRepo(repo));
        }

        let base = base.unwrap_or_else(|| {
            let name = repo
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "repo".to_string());
            repo.parent()
                .unwrap_or(Path::new("."))
                .join(format!("{name}-offload-worktrees"))
        });

        Ok(Self {
            repo,
            base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Conventional branch name for a task: `offload/<task-id>`.
    pub fn branch_name(task_id: Uuid) -> String {
        format!("offload/{task_id}")
    }

    /// Where the worktree for a branch lives. Slashes become `--` so the
    /// branch maps to a single directory under the base.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.base.join(branch.replace('/', "--"))
    }

    /// Create (or reuse) the worktree for a branch, checked out from
    /// `start_point` when the branch does not exist yet.
    ///
    /// Idempotent: a directory already holding the branch is returned
    /// as-is, so a crashed spawn can simply run again.
    pub fn create_worktree(
        &self,
        branch: &str,
        start_point: Option<&str>,
    ) -> Result<PathBuf, WorktreeError> {
        let _guard = self.lock();
        let path = self.worktree_path(branch);

        if path.is_dir() {
            let found = self.current_branch(&path)?;
            if found == branch {
                tracing::info!(path = %path.display(), branch, "reusing existing worktree");
                return Ok(path);
            }
            return Err(WorktreeError::WrongBranch {
                path,
                expected: branch.to_string(),
                found,
            });
        }

        std::fs::create_dir_all(&self.base).map_err(|source| WorktreeError::Io {
            path: self.base.clone(),
            source,
        })?;

        let path_str = path.to_string_lossy().into_owned();
        let result = if self.branch_exists(branch)? {
            self.git(&["worktree", "add", path_str.as_str(), branch])
        } else {
            let mut args = vec!["worktree", "add", "-b", branch, path_str.as_str()];
            if let Some(start) = start_point {
                args.push(start);
            }
            self.git(&args)
        };

        if let Err(err) = result {
            // Leave no half-made worktree behind.
            if path.exists() {
                let _ = std::fs::remove_dir_all(&path);
            }
            let _ = self.git(&["worktree", "prune"]);
            return Err(err);
        }

        Ok(path)
    }

    /// Drop a worktree directory and deregister it. Safe to call twice.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _guard = self.lock();

        if !path.exists() {
            // Already gone; just let git forget any stale registration.
            let _ = self.git(&["worktree", "prune"]);
            return Ok(());
        }

        let path_str = path.to_string_lossy().into_owned();
        match self.git(&["worktree", "remove", "--force", path_str.as_str()]) {
            Ok(_) => Ok(()),
            Err(WorktreeError::Git { detail, .. }) if detail.contains("not a working tree") => {
                // A bare directory under the base that git never knew
                // about; removing it by hand is all there is to do.
                std::fs::remove_dir_all(path).map_err(|source| WorktreeError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Stage and commit everything in a worktree. `Ok(false)` means the
    /// tree was already clean.
    pub fn commit_all(&self, worktree: &Path, message: &str) -> Result<bool, WorktreeError> {
        git_in(worktree, &["add", "-A"])?;
        let dirty = !git_in(worktree, &["status", "--porcelain"])?.trim().is_empty();
        if dirty {
            git_in(worktree, &["commit", "-m", message])?;
        }
        Ok(dirty)
    }

    /// Merge a task branch into the repository's current branch with
    /// `--no-ff`. Conflicts abort the merge and report it rather than
    /// leaving the repository mid-merge.
    pub fn merge_branch(&self, branch: &str) -> Result<MergeResult, WorktreeError> {
        let _guard = self.lock();

        let output = run_git(&self.repo, &["merge", "--no-ff", branch]).map_err(|source| {
            WorktreeError::Git {
                command: "merge".to_string(),
                detail: source.to_string(),
            }
        })?;
        if output.status.success() {
            return Ok(MergeResult::Merged);
        }

        let transcript = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if transcript.contains("CONFLICT") || transcript.contains("Automatic merge failed") {
            let _ = self.git(&["merge", "--abort"]);
            return Ok(MergeResult::Conflict {
                details: transcript.trim().to_string(),
            });
        }

        Err(WorktreeError::Git {
            command: "merge".to_string(),
            detail: transcript.trim().to_string(),
        })
    }

    /// Write the changes a task branch carries relative to `base_ref` into
    /// a patch file.
    pub fn write_patch(
        &self,
        branch: &str,
        base_ref: &str,
        out_path: &Path,
    ) -> Result<(), WorktreeError> {
        let range = format!("{base_ref}...{branch}");
        let diff = self.git(&["diff", &range])?;

        if let Some(dir) = out_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| WorktreeError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(out_path, diff).map_err(|source| WorktreeError::Io {
            path: out_path.to_path_buf(),
            source,
        })
    }

    /// Push a task branch to `origin`.
    pub fn push_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        self.git(&["push", "-u", "origin", branch]).map(|_| ())
    }

    /// Delete a local branch. A branch that does not exist is not an
    /// error; finishing a task twice must not fail on the second pass.
    pub fn delete_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        let _guard = self.lock();
        if !self.branch_exists(branch)? {
            return Ok(());
        }
        self.git(&["branch", "-D", branch]).map(|_| ())
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool, WorktreeError> {
        let probe = format!("refs/heads/{branch}");
        let output =
            run_git(&self.repo, &["rev-parse", "--verify", "--quiet", &probe]).map_err(
                |source| WorktreeError::Git {
                    command: "rev-parse --verify".to_string(),
                    detail: source.to_string(),
                },
            )?;
        Ok(output.status.success())
    }

    /// The branch checked out in a worktree directory.
    fn current_branch(&self, worktree: &Path) -> Result<String, WorktreeError> {
        Ok(git_in(worktree, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Run git in the main repository, requiring success.
    fn git(&self, args: &[&str]) -> Result<String, WorktreeError> {
        git_in(&self.repo, args)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.git_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn git with the given args in `cwd` and collect its output.
fn run_git(cwd: &Path, args: &[&str]) -> std::io::Result<Output> {
    Command::new("git").args(args).current_dir(cwd).output()
}

/// Run git in `cwd`, treating a non-zero exit as an error carrying the
/// command line and stderr. Returns stdout on success.
fn git_in(cwd: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let command = args.join(" ");
    let output = run_git(cwd, args).map_err(|source| WorktreeError::Git {
        command: command.clone(),
        detail: source.to_string(),
    })?;

    if !output.status.success() {
        return Err(WorktreeError::Git {
            command,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
