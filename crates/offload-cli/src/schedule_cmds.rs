//! `offload schedule ...`: create, list, inspect, and steer schedules.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use offload_core::manager::DelegateRequest;
use offload_core::scheduler::CreateScheduleRequest;
use offload_db::models::{MissedRunPolicy, Schedule, ScheduleStatus, ScheduleType};

use crate::ScheduleCommands;
use crate::bootstrap;
use crate::config::OffloadConfig;

pub async fn run(config: OffloadConfig, command: ScheduleCommands) -> Result<i32> {
    if let ScheduleCommands::Create { cron, at, .. } = &command {
        if cron.is_some() == at.is_some() {
            anyhow::bail!("exactly one of --cron or --at is required");
        }
    }

    let kernel = bootstrap::start_passive_kernel(&config).await?;

    let result = match command {
        ScheduleCommands::Create {
            prompt,
            cron,
            at,
            timezone,
            missed_run_policy,
            max_runs,
            expires_at,
            after,
            working_dir,
        } => {
            let schedule_type = if cron.is_some() {
                ScheduleType::Cron
            } else {
                ScheduleType::OneTime
            };
            let missed_run_policy: MissedRunPolicy = missed_run_policy
                .parse()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let scheduled_at = at.as_deref().map(parse_timestamp).transpose()?;
            let expires_at = expires_at.as_deref().map(parse_timestamp).transpose()?;

            let working_directory = match working_dir {
                Some(dir) => dir,
                None => std::env::current_dir()?.to_string_lossy().into_owned(),
            };

            let schedule = kernel
                .schedules
                .create(CreateScheduleRequest {
                    task_template: DelegateRequest {
                        prompt,
                        working_directory,
                        ..DelegateRequest::default()
                    },
                    schedule_type,
                    cron_expression: cron,
                    scheduled_at,
                    timezone: Some(timezone),
                    missed_run_policy: Some(missed_run_policy),
                    max_runs,
                    expires_at,
                    after_schedule_id: after,
                })
                .await?;

            println!("{}", schedule.id);
            print_schedule(&schedule);
            Ok(0)
        }
        ScheduleCommands::List {
            status,
            limit,
            offset,
        } => {
            let status: Option<ScheduleStatus> = status
                .as_deref()
                .map(|s| s.parse().map_err(|e| anyhow::anyhow!("{e}")))
                .transpose()?;
            let schedules = kernel.schedules.list(status, limit, offset).await?;
            if schedules.is_empty() {
                println!("no schedules");
            } else {
                println!("{:<38}  {:<9}  {:<8}  next run", "id", "status", "type");
                for schedule in &schedules {
                    println!(
                        "{:<38}  {:<9}  {:<8}  {}",
                        schedule.id,
                        schedule.status.to_string(),
                        schedule.schedule_type.to_string(),
                        schedule
                            .next_run_at
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Ok(0)
        }
        ScheduleCommands::Show { schedule_id } => {
            let (schedule, history) = kernel.schedules.get(&schedule_id, true).await?;
            print_schedule(&schedule);
            if !history.is_empty() {
                println!("executions:");
                for execution in &history {
                    println!(
                        "  {}  {:<9}  task {}",
                        execution.scheduled_for.to_rfc3339(),
                        execution.status.to_string(),
                        execution
                            .task_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                }
            }
            Ok(0)
        }
        ScheduleCommands::Pause { schedule_id } => {
            kernel.schedules.pause(&schedule_id).await?;
            println!("paused {schedule_id}");
            Ok(0)
        }
        ScheduleCommands::Resume { schedule_id } => {
            kernel.schedules.resume(&schedule_id).await?;
            println!("resumed {schedule_id}");
            Ok(0)
        }
        ScheduleCommands::Cancel { schedule_id } => {
            kernel.schedules.cancel(&schedule_id).await?;
            println!("cancelled {schedule_id}");
            Ok(0)
        }
    };

    kernel.stop().await;
    result
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp {raw:?}"))
}

fn print_schedule(schedule: &Schedule) {
    println!("id:         {}", schedule.id);
    println!("type:       {}", schedule.schedule_type);
    println!("status:     {}", schedule.status);
    if let Some(ref expr) = schedule.cron_expression {
        println!("cron:       {expr} ({})", schedule.timezone);
    }
    if let Some(at) = schedule.scheduled_at {
        println!("at:         {}", at.to_rfc3339());
    }
    println!("policy:     {}", schedule.missed_run_policy);
    println!(
        "runs:       {}{}",
        schedule.run_count,
        schedule
            .max_runs
            .map(|m| format!(" of {m}"))
            .unwrap_or_default()
    );
    if let Some(next) = schedule.next_run_at {
        println!("next run:   {}", next.to_rfc3339());
    }
    if let Some(ref after) = schedule.after_schedule_id {
        println!("after:      {after}");
    }
}
