mod bootstrap;
mod cleanup_cmd;
mod config;
mod delegate_cmd;
mod log_cmd;
mod schedule_cmds;
mod serve_cmd;
mod status_cmd;
mod task_cmds;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::OffloadConfig;
use offload_core::error::{ErrorCode, KernelError};

#[derive(Parser)]
#[command(name = "offload", about = "Delegate long-running agent tasks to a local daemon")]
struct Cli {
    /// Database path (overrides OFFLOAD_DB_PATH and the config file)
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the daemon in the foreground until interrupted
    Serve {
        /// Directory for a per-launch log file (in addition to stderr)
        #[arg(long)]
        log_dir: Option<String>,
    },
    /// Submit a task and wait for it to finish
    Delegate {
        /// The prompt handed to the agent binary
        prompt: String,
        /// Priority: p0, p1, or p2
        #[arg(long, default_value = "p2")]
        priority: String,
        /// Working directory for the task (defaults to the current dir)
        #[arg(long)]
        working_dir: Option<String>,
        /// Task ids this task depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Wall-time budget in milliseconds
        #[arg(long)]
        timeout: Option<i64>,
        /// Output buffer cap in bytes
        #[arg(long)]
        max_output_buffer: Option<i64>,
        /// Run in an isolated git worktree
        #[arg(long)]
        use_worktree: bool,
        /// Merge strategy for worktree results: pr, auto, manual, patch
        #[arg(long)]
        merge_strategy: Option<String>,
        /// Base branch for the worktree
        #[arg(long)]
        base_branch: Option<String>,
        /// Commit the agent's tree before applying the merge strategy
        #[arg(long)]
        auto_commit: bool,
        /// Seed the prompt from this task's latest checkpoint
        #[arg(long)]
        continue_from: Option<String>,
        /// Submit without waiting; the task runs on the next serve
        #[arg(long)]
        detach: bool,
    },
    /// Show one task, or the latest tasks
    Status {
        /// Task id (omit to list recent tasks)
        task_id: Option<String>,
        /// Emit JSON instead of the table
        #[arg(long)]
        json: bool,
    },
    /// Show captured output of a task
    Logs {
        task_id: String,
        /// Last N chunks per stream (1-1000)
        #[arg(long, default_value_t = 100)]
        tail: usize,
    },
    /// Cancel a queued or running task
    Cancel {
        task_id: String,
        /// Reason recorded on the task
        #[arg(long)]
        reason: Option<String>,
    },
    /// Re-run a settled task with its original configuration
    Retry { task_id: String },
    /// Re-run a settled task, seeding the prompt from its checkpoint
    Resume {
        task_id: String,
        /// Extra context appended to the seeded prompt
        #[arg(long)]
        context: Option<String>,
    },
    /// Schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Delete terminal tasks older than the retention window
    Cleanup,
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Create a cron or one-time schedule
    Create {
        /// The prompt each run delegates
        prompt: String,
        /// Cron expression (mutually exclusive with --at)
        #[arg(long)]
        cron: Option<String>,
        /// One-time run at an RFC 3339 timestamp (mutually exclusive with --cron)
        #[arg(long)]
        at: Option<String>,
        /// IANA timezone for cron evaluation
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Missed-run policy: skip, catchup, fail
        #[arg(long, default_value = "skip")]
        missed_run_policy: String,
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<i64>,
        /// Expire at an RFC 3339 timestamp
        #[arg(long)]
        expires_at: Option<String>,
        /// Chain after another schedule's latest task
        #[arg(long)]
        after: Option<String>,
        /// Working directory for materialized tasks
        #[arg(long)]
        working_dir: Option<String>,
    },
    /// List schedules
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one schedule with its execution history
    Show { schedule_id: String },
    /// Pause an active schedule
    Pause { schedule_id: String },
    /// Resume a paused schedule
    Resume { schedule_id: String },
    /// Cancel a schedule
    Cancel { schedule_id: String },
}

/// Exit code for an interrupted foreground wait.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Verbosity chain: `OFFLOAD_LOG` env > configured log level > info.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_env("OFFLOAD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<KernelError>() {
                Some(kernel_err) => eprintln!("error: {kernel_err}"),
                None => eprintln!("error: {err:#}"),
            }
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    // Init needs no database and no resolved config.
    if let Commands::Init { force } = &cli.command {
        init_tracing("info");
        return init_config(*force);
    }

    let config = OffloadConfig::resolve(cli.db_path.as_deref())?;
    init_tracing(&config.kernel.log_level);

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Serve { log_dir } => serve_cmd::run(config, log_dir).await,
        Commands::Delegate {
            prompt,
            priority,
            working_dir,
            depends_on,
            timeout,
            max_output_buffer,
            use_worktree,
            merge_strategy,
            base_branch,
            auto_commit,
            continue_from,
            detach,
        } => {
            delegate_cmd::run(
                config,
                delegate_cmd::DelegateArgs {
                    prompt,
                    priority,
                    working_dir,
                    depends_on,
                    timeout,
                    max_output_buffer,
                    use_worktree,
                    merge_strategy,
                    base_branch,
                    auto_commit,
                    continue_from,
                    detach,
                },
            )
            .await
        }
        Commands::Status { task_id, json } => status_cmd::run(config, task_id, json).await,
        Commands::Logs { task_id, tail } => log_cmd::run(config, task_id, tail).await,
        Commands::Cancel { task_id, reason } => {
            task_cmds::cancel(config, task_id, reason).await
        }
        Commands::Retry { task_id } => task_cmds::retry(config, task_id).await,
        Commands::Resume { task_id, context } => {
            task_cmds::resume(config, task_id, context).await
        }
        Commands::Schedule { command } => schedule_cmds::run(config, command).await,
        Commands::Cleanup => cleanup_cmd::run(config).await,
    }
}

fn init_config(force: bool) -> Result<i32> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("wrote {}", path.display());
    Ok(0)
}

/// Parse a task id, accepting only the canonical hyphenated UUID form.
pub fn parse_task_id(raw: &str) -> Result<uuid::Uuid> {
    let parsed = uuid::Uuid::parse_str(raw)
        .map_err(|_| KernelError::new(ErrorCode::Validation, format!("invalid task id {raw:?}")))?;
    if !raw.eq_ignore_ascii_case(&parsed.hyphenated().to_string()) {
        anyhow::bail!(KernelError::new(
            ErrorCode::Validation,
            format!("task id must be in canonical form, got {raw:?}"),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_task_ids_parse() {
        let id = uuid::Uuid::new_v4();
        let parsed = parse_task_id(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn non_canonical_forms_are_rejected() {
        let id = uuid::Uuid::new_v4();
        // Braced and simple forms parse as UUIDs but are not canonical.
        assert!(parse_task_id(&format!("{{{id}}}")).is_err());
        assert!(parse_task_id(&id.simple().to_string()).is_err());
        assert!(parse_task_id("not-a-uuid").is_err());
    }
}
