//! `offload delegate`: submit a task. By default the kernel runs in this
//! process until the task settles; `--detach` just records it for the next
//! serve.

use std::time::Duration;

use anyhow::Result;

use offload_core::kernel::KernelOptions;
use offload_core::manager::DelegateRequest;
use offload_db::models::{MergeStrategy, TaskPriority, TaskStatus};

use crate::bootstrap;
use crate::config::OffloadConfig;
use crate::parse_task_id;

pub struct DelegateArgs {
    pub prompt: String,
    pub priority: String,
    pub working_dir: Option<String>,
    pub depends_on: Vec<String>,
    pub timeout: Option<i64>,
    pub max_output_buffer: Option<i64>,
    pub use_worktree: bool,
    pub merge_strategy: Option<String>,
    pub base_branch: Option<String>,
    pub auto_commit: bool,
    pub continue_from: Option<String>,
    pub detach: bool,
}

pub async fn run(config: OffloadConfig, args: DelegateArgs) -> Result<i32> {
    let priority: TaskPriority = args
        .priority
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let merge_strategy: Option<MergeStrategy> = args
        .merge_strategy
        .as_deref()
        .map(|s| s.parse().map_err(|e| anyhow::anyhow!("{e}")))
        .transpose()?;
    let depends_on = args
        .depends_on
        .iter()
        .map(|raw| parse_task_id(raw))
        .collect::<Result<Vec<_>>>()?;
    let continue_from = args
        .continue_from
        .as_deref()
        .map(parse_task_id)
        .transpose()?;

    let working_directory = match args.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?.to_string_lossy().into_owned(),
    };

    let request = DelegateRequest {
        prompt: args.prompt,
        priority: Some(priority),
        working_directory,
        use_worktree: args.use_worktree,
        merge_strategy,
        base_branch: args.base_branch,
        auto_commit: args.auto_commit,
        timeout_ms: args.timeout,
        max_output_buffer_bytes: args.max_output_buffer,
        depends_on,
        continue_from,
        ..DelegateRequest::default()
    };

    if args.detach {
        // Record only: the next `offload serve` picks it up via recovery.
        let kernel = bootstrap::start_passive_kernel(&config).await?;
        let task = kernel.manager.delegate(request).await?;
        println!("{}", task.id);
        println!("queued (runs on the next `offload serve`)");
        kernel.stop().await;
        return Ok(0);
    }

    let mut options = KernelOptions::default();
    options.enable_scheduler = false;
    let kernel = bootstrap::start_kernel(&config, options).await?;

    let task = kernel.manager.delegate(request).await?;
    println!("{}", task.id);

    // Wait the task (and nothing else) out, then mirror its outcome.
    let settled = loop {
        let status = kernel.manager.get_status(Some(task.id)).await?;
        if status[0].status.is_terminal() {
            break status.into_iter().next().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };

    match settled.status {
        TaskStatus::Completed => println!("completed (exit 0)"),
        TaskStatus::Failed => println!(
            "failed: {}",
            settled.error_message.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Cancelled => println!("cancelled"),
        _ => unreachable!("loop exits only on terminal status"),
    }

    let ok = settled.status == TaskStatus::Completed;
    kernel.stop().await;
    Ok(if ok { 0 } else { 1 })
}
