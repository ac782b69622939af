//! Durable state store for the offload kernel: an embedded SQLite database
//! holding tasks, outputs, dependency edges, schedules, and checkpoints.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
