//! `offload logs`: captured output of one task.

use anyhow::Result;

use crate::bootstrap;
use crate::config::OffloadConfig;
use crate::parse_task_id;

pub async fn run(config: OffloadConfig, task_id: String, tail: usize) -> Result<i32> {
    let task_id = parse_task_id(&task_id)?;

    let kernel = bootstrap::start_passive_kernel(&config).await?;
    let logs = kernel.manager.get_logs(task_id, Some(tail)).await?;

    for chunk in &logs.stdout {
        print!("{chunk}");
    }
    for chunk in &logs.stderr {
        eprint!("{chunk}");
    }
    if logs.stdout.is_empty() && logs.stderr.is_empty() {
        println!("(no output captured)");
    }

    kernel.stop().await;
    Ok(0)
}
