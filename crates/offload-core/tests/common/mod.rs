//! Shared scaffolding for kernel integration tests.
//!
//! Kernels here run `bash -c <prompt>` as the agent binary, with the
//! resource sampling loop off and spawn pacing zeroed so tests are fast
//! and deterministic.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use offload_core::config::KernelConfig;
use offload_core::events::{Event, handler};
use offload_core::kernel::{self, Kernel, KernelOptions};
use offload_core::manager::DelegateRequest;
use offload_test_utils::TestDb;

pub struct TestKernel {
    pub kernel: Kernel,
    pub events: Arc<Mutex<Vec<Event>>>,
    _state_dir: TempDir,
}

pub fn test_config() -> KernelConfig {
    KernelConfig {
        agent_binary: "bash".to_string(),
        agent_args: vec!["-c".to_string()],
        kill_grace_period_ms: 300,
        settling_window_ms: 0,
        min_spawn_delay_ms: 0,
        event_request_timeout_ms: 2_000,
        ..KernelConfig::default()
    }
}

/// Build and start a kernel over the given test database.
pub async fn start_kernel(
    db: &TestDb,
    mut options: KernelOptions,
    tweak: impl FnOnce(&mut KernelConfig),
) -> TestKernel {
    // Real host samples would make admission depend on the machine the
    // tests run on, and the tick loop is driven by hand.
    options.enable_monitor = false;
    options.enable_scheduler = false;

    let mut config = test_config();
    tweak(&mut config);

    let state_dir = TempDir::new().expect("state dir");
    let mut kernel = kernel::build(
        config,
        db.pool.clone(),
        state_dir.path().to_path_buf(),
        options,
    );

    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    kernel
        .bus
        .subscribe_all(handler(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        }))
        .expect("recorder subscription");

    kernel.start().await.expect("kernel start");

    TestKernel {
        kernel,
        events,
        _state_dir: state_dir,
    }
}

pub fn request(prompt: &str) -> DelegateRequest {
    DelegateRequest {
        prompt: prompt.to_string(),
        working_directory: "/tmp".to_string(),
        ..DelegateRequest::default()
    }
}

/// Poll the recorded events until one matches, or panic after ~10 s.
pub async fn wait_for_event(
    events: &Arc<Mutex<Vec<Event>>>,
    what: &str,
    predicate: impl Fn(&Event) -> bool,
) -> Event {
    for _ in 0..200 {
        {
            let recorded = events.lock().unwrap();
            if let Some(found) = recorded.iter().find(|ev| predicate(ev)) {
                return found.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_terminal(events: &Arc<Mutex<Vec<Event>>>, task_id: Uuid) -> Event {
    wait_for_event(events, "terminal event", |ev| {
        matches!(
            ev,
            Event::TaskCompleted { task_id: id, .. }
            | Event::TaskFailed { task_id: id, .. }
            | Event::TaskCancelled { task_id: id, .. }
            | Event::TaskTimeout { task_id: id, .. }
            if *id == task_id
        )
    })
    .await
}

/// Index of the first recorded event matching the predicate.
pub fn position(
    events: &Arc<Mutex<Vec<Event>>>,
    predicate: impl Fn(&Event) -> bool,
) -> Option<usize> {
    events.lock().unwrap().iter().position(|ev| predicate(ev))
}
