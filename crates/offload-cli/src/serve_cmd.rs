//! `offload serve`: run the full kernel in the foreground until SIGINT.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use offload_core::kernel::KernelOptions;

use crate::bootstrap;
use crate::config::OffloadConfig;
use crate::EXIT_INTERRUPTED;

pub async fn run(config: OffloadConfig, log_dir: Option<String>) -> Result<i32> {
    let mut launch_log = log_dir
        .map(|dir| open_launch_log(PathBuf::from(dir)))
        .transpose()?;

    let kernel = bootstrap::start_kernel(&config, KernelOptions::default()).await?;

    println!(
        "offload daemon running (db: {})",
        config.db.database_path.display()
    );
    if let Some(ref mut log) = launch_log {
        writeln!(
            log,
            "{} serve started, db={}",
            Utc::now().to_rfc3339(),
            config.db.database_path.display()
        )
        .ok();
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received, shutting down");

    kernel.stop().await;

    if let Some(ref mut log) = launch_log {
        writeln!(log, "{} serve stopped", Utc::now().to_rfc3339()).ok();
    }
    println!("stopped");
    Ok(EXIT_INTERRUPTED)
}

/// A per-launch text log file under the given directory.
fn open_launch_log(dir: PathBuf) -> Result<std::fs::File> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let path = dir.join(format!(
        "offload-{}.log",
        Utc::now().format("%Y%m%d-%H%M%S")
    ));
    std::fs::File::create(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))
}
