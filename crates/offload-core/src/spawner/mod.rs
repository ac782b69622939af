//! OS-level spawning of the delegated agent binary.
//!
//! The prompt travels as the sole positional argument after any configured
//! extra args. No shell is involved, so nothing in the prompt is ever
//! interpreted. The child inherits the daemon's environment.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{ErrorCode, KernelError, KernelResult};

/// A freshly forked child and its pid.
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Spawns and signals agent processes.
pub struct ProcessSpawner {
    binary: String,
    extra_args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            binary: config.agent_binary.clone(),
            extra_args: config.agent_args.clone(),
        }
    }

    /// Spawn the agent binary for one task.
    ///
    /// Fails fast with `PROCESS_SPAWN_FAILED`, preserving the OS error
    /// code in the error context.
    pub fn spawn(
        &self,
        prompt: &str,
        working_dir: &Path,
        task_id: Uuid,
    ) -> KernelResult<SpawnedChild> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .arg(prompt)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The worker pool reaps children itself; an accidental drop
            // must not SIGKILL a task out from under it.
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|err| self.classify(err, task_id))?;

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                // Exited between fork and here; the wait() in the worker
                // pool would hang on a pid of 0, so reject the spawn.
                let _ = child.start_kill();
                return Err(KernelError::new(
                    ErrorCode::ProcessSpawnFailed,
                    "child exited before a pid could be observed",
                )
                .with_context("task_id", task_id.to_string()));
            }
        };

        debug!(task_id = %task_id, pid, binary = %self.binary, "spawned agent process");
        Ok(SpawnedChild { child, pid })
    }

    /// Ask a child to terminate with SIGTERM. The caller escalates to
    /// SIGKILL after the grace period if the child ignores it.
    ///
    /// A pid that is already gone is not an error.
    pub fn kill(&self, pid: u32) {
        #[cfg(unix)]
        {
            // SAFETY: pid came from a child this process spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM delivery failed (child already gone?)");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }

    fn classify(&self, err: std::io::Error, task_id: Uuid) -> KernelError {
        let detail = match err.kind() {
            std::io::ErrorKind::NotFound => {
                format!("agent binary '{}' not found on PATH", self.binary)
            }
            std::io::ErrorKind::PermissionDenied => {
                format!("agent binary '{}' is not executable", self.binary)
            }
            _ => format!("failed to spawn '{}': {err}", self.binary),
        };

        let mut kernel_err = KernelError::new(ErrorCode::ProcessSpawnFailed, detail)
            .with_context("task_id", task_id.to_string());
        if let Some(code) = err.raw_os_error() {
            kernel_err = kernel_err.with_context("os_error", code.to_string());
        }
        kernel_err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawner_for(binary: &str) -> ProcessSpawner {
        ProcessSpawner::new(&KernelConfig {
            agent_binary: binary.to_string(),
            ..KernelConfig::default()
        })
    }

    #[tokio::test]
    async fn spawn_runs_binary_with_prompt_argument() {
        // `echo` prints its argument, so the prompt round-trips.
        let spawner = spawner_for("echo");
        let mut spawned = spawner
            .spawn("hello world", Path::new("/tmp"), Uuid::new_v4())
            .unwrap();
        assert!(spawned.pid > 0);

        let output = spawned
            .child
            .wait_with_output()
            .await
            .expect("child should run");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello world\n");
    }

    #[tokio::test]
    async fn missing_binary_is_a_typed_error() {
        let spawner = spawner_for("/nonexistent/agent-binary");
        let err = spawner
            .spawn("prompt", Path::new("/tmp"), Uuid::new_v4())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProcessSpawnFailed);
        assert!(err.message.contains("not found"));
        assert!(err.context.contains_key("os_error"));
    }

    #[tokio::test]
    async fn kill_on_dead_pid_does_not_panic() {
        let spawner = spawner_for("true");
        let mut spawned = spawner
            .spawn("x", Path::new("/tmp"), Uuid::new_v4())
            .unwrap();
        let pid = spawned.pid;
        let _ = spawned.child.wait().await;

        // Child has exited; signalling it again must be harmless.
        spawner.kill(pid);
    }

    #[tokio::test]
    async fn prompt_is_not_shell_interpolated() {
        let spawner = spawner_for("echo");
        let mut spawned = spawner
            .spawn("$(whoami); rm -rf /", Path::new("/tmp"), Uuid::new_v4())
            .unwrap();

        let output = spawned.child.wait_with_output().await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            "$(whoami); rm -rf /\n"
        );
    }
}
