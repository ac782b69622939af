//! The detach-then-serve workflow the CLI relies on: a task recorded by a
//! passive kernel (as `delegate --detach` does) must be picked up and run
//! by the next full kernel boot, via recovery. Exercises the same library
//! calls the command modules make, without driving the binary.

use std::time::Duration;

use offload_core::config::KernelConfig;
use offload_core::kernel::{self, KernelOptions};
use offload_core::manager::DelegateRequest;
use offload_db::models::TaskStatus;
use offload_db::queries::tasks;
use offload_test_utils::create_test_db;
use tempfile::TempDir;

fn cli_like_config() -> KernelConfig {
    KernelConfig {
        agent_binary: "bash".to_string(),
        agent_args: vec!["-c".to_string()],
        settling_window_ms: 0,
        min_spawn_delay_ms: 0,
        ..KernelConfig::default()
    }
}

#[tokio::test]
async fn detached_delegation_runs_on_the_next_serve() {
    let db = create_test_db().await;
    let state_dir = TempDir::new().unwrap();

    // `offload delegate --detach`: passive kernel, submit, stop.
    let mut passive = kernel::build(
        cli_like_config(),
        db.pool.clone(),
        state_dir.path().to_path_buf(),
        KernelOptions::passive(),
    );
    passive.start().await.unwrap();
    let task = passive
        .manager
        .delegate(DelegateRequest {
            prompt: "echo picked up".to_string(),
            working_directory: "/tmp".to_string(),
            ..DelegateRequest::default()
        })
        .await
        .unwrap();
    passive.stop().await;

    let row = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Queued);

    // `offload serve`: full kernel over the same store; recovery requeues
    // the task and the worker handler runs it.
    let mut serve = kernel::build(
        cli_like_config(),
        db.pool.clone(),
        state_dir.path().to_path_buf(),
        KernelOptions {
            enable_monitor: false,
            enable_scheduler: false,
            ..KernelOptions::default()
        },
    );
    let report = serve.start().await.unwrap();
    assert_eq!(report.requeued, 1);

    let mut finished = false;
    for _ in 0..100 {
        let row = tasks::get_task(&db.pool, task.id).await.unwrap().unwrap();
        if row.status.is_terminal() {
            assert_eq!(row.status, TaskStatus::Completed);
            assert_eq!(row.exit_code, Some(0));
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(finished, "detached task did not run under serve");

    serve.stop().await;
}
