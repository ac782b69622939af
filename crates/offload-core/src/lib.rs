//! The offload orchestration kernel.
//!
//! One process, cooperating components, a single event bus: tasks arrive
//! through the [`manager::TaskManager`], travel the bus as typed
//! [`events::Event`]s, run as child processes owned by the
//! [`workers::WorkerPool`], and settle into the store with their captured
//! output. Schedules replay delegate requests on cron or one-time timers,
//! and recovery reconciles the store after a restart.

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod kernel;
pub mod manager;
pub mod monitor;
pub mod output;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod spawner;
pub mod workers;
pub mod worktree;
