//! `offload status`: one task in detail, or the latest tasks as a table.

use anyhow::Result;

use offload_db::models::Task;

use crate::bootstrap;
use crate::config::OffloadConfig;
use crate::parse_task_id;

pub async fn run(config: OffloadConfig, task_id: Option<String>, json: bool) -> Result<i32> {
    let task_id = task_id.as_deref().map(parse_task_id).transpose()?;

    let kernel = bootstrap::start_passive_kernel(&config).await?;
    let tasks = kernel.manager.get_status(task_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        match task_id {
            Some(_) => print_detail(&tasks[0]),
            None => {
                if tasks.is_empty() {
                    println!("no tasks");
                } else {
                    print_table(&tasks);
                }
            }
        }
    }

    kernel.stop().await;
    Ok(0)
}

fn print_detail(task: &Task) {
    println!("id:               {}", task.id);
    println!("status:           {}", task.status);
    println!("priority:         {}", task.priority);
    println!("created:          {}", task.created_at.to_rfc3339());
    if let Some(started) = task.started_at {
        println!("started:          {}", started.to_rfc3339());
    }
    if let Some(completed) = task.completed_at {
        println!("completed:        {}", completed.to_rfc3339());
    }
    if let Some(code) = task.exit_code {
        println!("exit code:        {code}");
    }
    if let Some(ref error) = task.error_message {
        println!("error:            {error}");
    }
    println!("working dir:      {}", task.working_directory);
    println!("dependency state: {}", task.dependency_state);
    if !task.depends_on.is_empty() {
        let deps: Vec<String> = task.depends_on.iter().map(|d| d.to_string()).collect();
        println!("depends on:       {}", deps.join(", "));
    }
    if task.retry_count > 0 {
        println!("retry:            attempt {} of chain {}", task.retry_count, task.parent_task_id);
    }
    if task.use_worktree {
        println!(
            "worktree:         branch {} ({})",
            task.branch.as_deref().unwrap_or("-"),
            task.merge_strategy
        );
    }
    println!("prompt:           {}", truncate(&task.prompt, 120));
}

fn print_table(tasks: &[Task]) {
    println!("{:<36}  {:<9}  {:<8}  prompt", "id", "status", "priority");
    for task in tasks {
        println!(
            "{:<36}  {:<9}  {:<8}  {}",
            task.id,
            task.status.to_string(),
            task.priority.to_string(),
            truncate(&task.prompt, 60)
        );
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{cut}…")
}
