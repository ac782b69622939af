//! Kernel tunables and their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard bounds on per-task wall time.
pub const MIN_TIMEOUT_MS: i64 = 1_000;
pub const MAX_TIMEOUT_MS: i64 = 86_400_000;

/// Hard bounds on per-task output buffers.
pub const MIN_OUTPUT_BUFFER_BYTES: i64 = 1_024;
pub const MAX_OUTPUT_BUFFER_BYTES: i64 = 1_073_741_824;

/// Maximum prompt length in bytes.
pub const MAX_PROMPT_BYTES: usize = 4_000;

/// Everything the kernel can be tuned with. All durations are milliseconds
/// to match the config file surface; helpers below convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Binary executed for each task; the prompt is its sole positional
    /// argument.
    pub agent_binary: String,
    /// Extra arguments placed before the prompt.
    pub agent_args: Vec<String>,

    /// Default logging verbosity (debug, info, warn, error); env filters
    /// override it.
    pub log_level: String,

    /// Default per-task wall time.
    pub timeout_ms: i64,
    /// Default per-task output buffer cap.
    pub max_output_buffer_bytes: i64,

    /// Cores held back from the admission budget.
    pub cpu_cores_reserved: u32,
    /// Free-memory floor below which no worker spawns.
    pub memory_reserve_bytes: u64,
    /// SIGTERM-to-SIGKILL grace period.
    pub kill_grace_period_ms: u64,
    /// Sampling cadence of the resource monitor.
    pub resource_monitor_interval_ms: u64,
    /// Minimum gap between consecutive spawns.
    pub min_spawn_delay_ms: u64,
    /// Window during which fresh spawns are counted directly because they
    /// are not yet visible in load averages.
    pub settling_window_ms: u64,
    /// Maximum spawns allowed inside one settling window.
    pub spawn_throttle: usize,

    /// Per-event-type subscriber cap on the bus.
    pub max_listeners_per_event: usize,
    /// Total subscription cap on the bus.
    pub max_total_subscriptions: usize,
    /// Correlated request timeout.
    pub event_request_timeout_ms: u64,

    /// Schedule executor tick cadence.
    pub schedule_check_interval_ms: u64,
    /// Lateness beyond which a due run is treated as missed.
    pub missed_run_grace_period_ms: u64,

    /// Terminal tasks older than this are eligible for cleanup.
    pub task_retention_days: u32,
    /// Delegations rejected once this many tasks are waiting.
    pub max_queued_tasks: usize,
    /// Completed-task output buffers kept in memory (LRU).
    pub completed_buffer_retention: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            agent_binary: "claude".to_string(),
            agent_args: Vec::new(),
            log_level: "info".to_string(),
            timeout_ms: 1_800_000,
            max_output_buffer_bytes: 10 * 1024 * 1024,
            cpu_cores_reserved: 1,
            memory_reserve_bytes: 1_073_741_824,
            kill_grace_period_ms: 5_000,
            resource_monitor_interval_ms: 2_000,
            min_spawn_delay_ms: 100,
            settling_window_ms: 2_000,
            spawn_throttle: 1,
            max_listeners_per_event: 100,
            max_total_subscriptions: 1_000,
            event_request_timeout_ms: 5_000,
            schedule_check_interval_ms: 60_000,
            missed_run_grace_period_ms: 300_000,
            task_retention_days: 30,
            max_queued_tasks: 1_000,
            completed_buffer_retention: 10,
        }
    }
}

impl KernelConfig {
    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_millis(self.kill_grace_period_ms)
    }

    pub fn resource_monitor_interval(&self) -> Duration {
        Duration::from_millis(self.resource_monitor_interval_ms)
    }

    pub fn event_request_timeout(&self) -> Duration {
        Duration::from_millis(self.event_request_timeout_ms)
    }

    pub fn schedule_check_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_check_interval_ms)
    }

    /// Clamp a requested timeout into the allowed range, falling back to
    /// the configured default when absent.
    pub fn clamp_timeout_ms(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.timeout_ms)
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS)
    }

    /// Clamp a requested buffer size into the allowed range, falling back
    /// to the configured default when absent.
    pub fn clamp_buffer_bytes(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.max_output_buffer_bytes)
            .clamp(MIN_OUTPUT_BUFFER_BYTES, MAX_OUTPUT_BUFFER_BYTES)
    }
}
