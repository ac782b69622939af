//! `offload cancel` / `retry` / `resume`.

use anyhow::Result;

use crate::bootstrap;
use crate::config::OffloadConfig;
use crate::parse_task_id;

pub async fn cancel(
    config: OffloadConfig,
    task_id: String,
    reason: Option<String>,
) -> Result<i32> {
    let task_id = parse_task_id(&task_id)?;

    let kernel = bootstrap::start_passive_kernel(&config).await?;
    kernel.manager.cancel(task_id, reason).await?;
    println!("cancelled {task_id}");
    kernel.stop().await;
    Ok(0)
}

pub async fn retry(config: OffloadConfig, task_id: String) -> Result<i32> {
    let task_id = parse_task_id(&task_id)?;

    let kernel = bootstrap::start_passive_kernel(&config).await?;
    let task = kernel.manager.retry(task_id).await?;
    println!("{}", task.id);
    println!(
        "retry {} of chain {} queued (runs on the next `offload serve`)",
        task.retry_count, task.parent_task_id
    );
    kernel.stop().await;
    Ok(0)
}

pub async fn resume(
    config: OffloadConfig,
    task_id: String,
    context: Option<String>,
) -> Result<i32> {
    let task_id = parse_task_id(&task_id)?;

    let kernel = bootstrap::start_passive_kernel(&config).await?;
    let task = kernel.manager.resume(task_id, context).await?;
    println!("{}", task.id);
    println!("resumed as a new task (runs on the next `offload serve`)");
    kernel.stop().await;
    Ok(0)
}
