//! Host resource sampling and worker admission.
//!
//! A background task samples CPU and free memory on a fixed cadence and
//! publishes each sample on the bus. The admission predicate additionally
//! counts workers spawned inside the settling window, because a child
//! forked milliseconds ago is invisible in load averages but very real.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::KernelConfig;
use crate::events::{Event, EventBus};

/// One sampled view of the host, as published on the bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub available_memory_bytes: u64,
    pub worker_count: usize,
}

struct Sample {
    cpu_percent: f32,
    available_memory_bytes: u64,
    cores: usize,
}

/// Samples the host and answers "may one more worker spawn right now?".
///
/// Only the worker handler mutates the counters; the monitor itself just
/// reads what it sampled.
pub struct ResourceMonitor {
    cpu_cores_reserved: u32,
    memory_reserve_bytes: u64,
    settling_window: Duration,
    min_spawn_delay: Duration,
    spawn_throttle: usize,
    interval: Duration,
    sample: Mutex<Sample>,
    worker_count: AtomicUsize,
    spawn_times: Mutex<VecDeque<Instant>>,
}

impl ResourceMonitor {
    pub fn new(config: &KernelConfig) -> Arc<Self> {
        Arc::new(Self {
            cpu_cores_reserved: config.cpu_cores_reserved,
            memory_reserve_bytes: config.memory_reserve_bytes,
            settling_window: Duration::from_millis(config.settling_window_ms),
            min_spawn_delay: Duration::from_millis(config.min_spawn_delay_ms),
            spawn_throttle: config.spawn_throttle,
            interval: config.resource_monitor_interval(),
            sample: Mutex::new(Sample {
                cpu_percent: 0.0,
                // No data yet: admission stays open until the first sample.
                available_memory_bytes: u64::MAX,
                cores: 0,
            }),
            worker_count: AtomicUsize::new(0),
            spawn_times: Mutex::new(VecDeque::new()),
        })
    }

    /// Spawn the sampling loop. It publishes `SystemResourcesUpdated` on
    /// each tick and stops when the token fires.
    pub fn start(
        self: &Arc<Self>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = monitor.interval.as_millis() as u64, "resource monitor started");
            let mut system = System::new();
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        system.refresh_cpu();
                        system.refresh_memory();

                        let cpu = system.global_cpu_info().cpu_usage();
                        let available = system.available_memory();
                        let cores = system.cpus().len();
                        monitor.record_sample(cpu, available, cores);

                        let snapshot = monitor.snapshot();
                        debug!(
                            cpu_percent = snapshot.cpu_percent,
                            available_mb = snapshot.available_memory_bytes / (1024 * 1024),
                            workers = snapshot.worker_count,
                            "sampled host resources"
                        );
                        if let Err(err) = bus.emit(Event::SystemResourcesUpdated { snapshot }).await {
                            debug!(error = %err, "resource update emit failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("resource monitor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Store a sample. The loop calls this every tick; tests call it
    /// directly to pin the host state.
    pub fn record_sample(&self, cpu_percent: f32, available_memory_bytes: u64, cores: usize) {
        let mut sample = self.sample.lock().unwrap_or_else(|e| e.into_inner());
        sample.cpu_percent = cpu_percent;
        sample.available_memory_bytes = available_memory_bytes;
        sample.cores = cores;
    }

    /// Current view of the host plus the live worker count.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let sample = self.sample.lock().unwrap_or_else(|e| e.into_inner());
        ResourceSnapshot {
            cpu_percent: sample.cpu_percent,
            available_memory_bytes: sample.available_memory_bytes,
            worker_count: self.worker_count.load(Ordering::SeqCst),
        }
    }

    /// The CPU ceiling derived from core count and the reserved cores.
    fn max_cpu_percent(&self, cores: usize) -> f32 {
        if cores == 0 {
            // No sample yet.
            return 100.0;
        }
        let usable = cores.saturating_sub(self.cpu_cores_reserved as usize).max(1);
        usable as f32 * 100.0 / cores as f32
    }

    /// Admission predicate: true iff a new worker may spawn right now.
    pub fn can_spawn_worker(&self) -> bool {
        let (cpu, available, cores) = {
            let sample = self.sample.lock().unwrap_or_else(|e| e.into_inner());
            (
                sample.cpu_percent,
                sample.available_memory_bytes,
                sample.cores,
            )
        };

        if cpu >= self.max_cpu_percent(cores) {
            return false;
        }
        if available <= self.memory_reserve_bytes {
            return false;
        }

        let now = Instant::now();
        let mut spawns = self.spawn_times.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(front) = spawns.front() {
            if now.duration_since(*front) > self.settling_window {
                spawns.pop_front();
            } else {
                break;
            }
        }
        if spawns.len() >= self.spawn_throttle {
            return false;
        }
        if let Some(last) = spawns.back() {
            if now.duration_since(*last) < self.min_spawn_delay {
                return false;
            }
        }

        true
    }

    /// Record a spawn the instant the child is forked, before it can show
    /// up in any load metric.
    pub fn record_spawn(&self) {
        self.spawn_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Instant::now());
    }

    pub fn increment_worker_count(&self) -> usize {
        self.worker_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decrement_worker_count(&self) -> usize {
        let previous = self.worker_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "worker count underflow");
        previous.saturating_sub(1)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with(config: KernelConfig) -> Arc<ResourceMonitor> {
        ResourceMonitor::new(&config)
    }

    fn idle_host(monitor: &ResourceMonitor) {
        // 8 cores, 4 GiB free, 5% load.
        monitor.record_sample(5.0, 4 * 1024 * 1024 * 1024, 8);
    }

    #[test]
    fn admission_allows_on_idle_host() {
        let monitor = monitor_with(KernelConfig::default());
        idle_host(&monitor);
        assert!(monitor.can_spawn_worker());
    }

    #[test]
    fn admission_blocks_on_cpu_pressure() {
        let monitor = monitor_with(KernelConfig::default());
        // 8 cores, 1 reserved: ceiling is 87.5%.
        monitor.record_sample(90.0, 4 * 1024 * 1024 * 1024, 8);
        assert!(!monitor.can_spawn_worker());

        monitor.record_sample(80.0, 4 * 1024 * 1024 * 1024, 8);
        assert!(monitor.can_spawn_worker());
    }

    #[test]
    fn admission_blocks_below_memory_floor() {
        let monitor = monitor_with(KernelConfig::default());
        monitor.record_sample(5.0, 512 * 1024 * 1024, 8);
        assert!(!monitor.can_spawn_worker());
    }

    #[test]
    fn settling_window_throttles_spawn_bursts() {
        let config = KernelConfig {
            spawn_throttle: 1,
            min_spawn_delay_ms: 0,
            ..KernelConfig::default()
        };
        let monitor = monitor_with(config);
        idle_host(&monitor);

        assert!(monitor.can_spawn_worker());
        monitor.record_spawn();
        // The fresh spawn has not settled: no second spawn yet.
        assert!(!monitor.can_spawn_worker());
    }

    #[test]
    fn min_spawn_delay_spaces_spawns() {
        let config = KernelConfig {
            spawn_throttle: 10,
            min_spawn_delay_ms: 60_000,
            ..KernelConfig::default()
        };
        let monitor = monitor_with(config);
        idle_host(&monitor);

        monitor.record_spawn();
        assert!(!monitor.can_spawn_worker());
    }

    #[test]
    fn worker_count_tracks_increments() {
        let monitor = monitor_with(KernelConfig::default());
        assert_eq!(monitor.worker_count(), 0);
        assert_eq!(monitor.increment_worker_count(), 1);
        assert_eq!(monitor.increment_worker_count(), 2);
        assert_eq!(monitor.decrement_worker_count(), 1);
        assert_eq!(monitor.worker_count(), 1);
    }

    #[test]
    fn snapshot_reflects_sample_and_count() {
        let monitor = monitor_with(KernelConfig::default());
        monitor.record_sample(42.0, 1234, 4);
        monitor.increment_worker_count();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.cpu_percent, 42.0);
        assert_eq!(snapshot.available_memory_bytes, 1234);
        assert_eq!(snapshot.worker_count, 1);
    }
}
