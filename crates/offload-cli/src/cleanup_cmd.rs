//! `offload cleanup`: retention sweep over terminal tasks.

use anyhow::Result;
use chrono::{Duration, Utc};

use offload_db::queries::tasks;

use crate::bootstrap;
use crate::config::OffloadConfig;

pub async fn run(config: OffloadConfig) -> Result<i32> {
    let pool = bootstrap::open_pool(&config).await?;

    let cutoff = Utc::now() - Duration::days(config.kernel.task_retention_days as i64);
    let removed = tasks::delete_terminal_before(&pool, cutoff).await?;

    println!(
        "removed {removed} task(s) older than {} days",
        config.kernel.task_retention_days
    );
    Ok(0)
}
