//! Shared test utilities for offload integration tests.
//!
//! Each test gets its own SQLite database file inside a temp directory,
//! with migrations applied. Keep the returned [`TestDb`] alive for the
//! duration of the test; dropping it removes the directory and the
//! database with it.

use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use offload_db::config::DbConfig;
use offload_db::models::{
    DependencyState, MergeStrategy, Task, TaskPriority, TaskStatus, WorktreeCleanup,
};
use offload_db::pool;

/// A migrated scratch database plus the directory that holds it.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("tasks.db"));

    let db_pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&db_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb {
        pool: db_pool,
        _dir: dir,
    }
}

/// Build a queued task with sensible defaults for tests.
pub fn sample_task(prompt: &str) -> Task {
    let id = Uuid::new_v4();
    Task {
        id,
        prompt: prompt.to_string(),
        priority: TaskPriority::P2,
        working_directory: "/tmp".to_string(),
        status: TaskStatus::Queued,
        exit_code: None,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        retry_count: 0,
        parent_task_id: id,
        retry_of: None,
        depends_on: Vec::new(),
        dependency_state: DependencyState::Ready,
        use_worktree: false,
        branch: None,
        base_branch: None,
        merge_strategy: MergeStrategy::Manual,
        worktree_cleanup: WorktreeCleanup::Auto,
        auto_commit: false,
        push_to_remote: false,
        pr_title: None,
        pr_body: None,
        timeout_ms: 1_800_000,
        max_output_buffer_bytes: 10 * 1024 * 1024,
        continue_from: None,
    }
}
