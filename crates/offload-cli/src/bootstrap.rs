//! Shared plumbing for the command modules: open the database and build a
//! kernel over it.

use anyhow::Result;
use sqlx::SqlitePool;

use offload_core::kernel::{self, Kernel, KernelOptions};
use offload_db::pool;

use crate::config::OffloadConfig;

/// Open the configured database and apply migrations.
pub async fn open_pool(config: &OffloadConfig) -> Result<SqlitePool> {
    let db_pool = pool::create_pool(&config.db).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    Ok(db_pool)
}

/// A started kernel with the given options.
pub async fn start_kernel(config: &OffloadConfig, options: KernelOptions) -> Result<Kernel> {
    let db_pool = open_pool(config).await?;
    let mut kernel = kernel::build(
        config.kernel.clone(),
        db_pool,
        config.state_dir(),
        options,
    );
    kernel.start().await?;
    Ok(kernel)
}

/// A kernel that answers queries and accepts submissions but runs no
/// workers or timers. One-shot commands use this.
pub async fn start_passive_kernel(config: &OffloadConfig) -> Result<Kernel> {
    start_kernel(config, KernelOptions::passive()).await
}
