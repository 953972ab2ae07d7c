use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use sysinfo::{ProcessesToUpdate, System};

use super::ParallelProcessor;
use crate::config::Config;

/// Shrink when CPU use is above this percentage.
pub const CPU_HIGH_PERCENT: f64 = 80.0;
/// Shrink when memory use is above this percentage.
pub const MEMORY_HIGH_PERCENT: f64 = 85.0;
/// Grow only when CPU use is below this percentage.
pub const CPU_LOW_PERCENT: f64 = 50.0;
/// Grow only when memory use is below this percentage.
pub const MEMORY_LOW_PERCENT: f64 = 60.0;
/// Grow only when network latency is below this many milliseconds.
pub const LATENCY_LOW_MS: u64 = 100;

const SHRINK_FACTOR: f64 = 0.6;
const GROW_FACTOR: f64 = 1.3;

/// A point-in-time view of host load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_latency_ms: u64,
}

/// The concurrency chosen by [`ParallelProcessor::adaptive_concurrency_control`]
/// together with the thresholds it was judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConcurrencyConfig {
    pub max_concurrency: usize,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub network_threshold_ms: u64,
}

/// Pure decision rule behind adaptive concurrency.
///
/// High load shrinks to `floor(current * 0.6)`, low load grows to
/// `floor(current * 1.3)`, anything in between keeps `current`. Every
/// outcome is clamped into `[5, 20]`, so a configured value below 5 is
/// lifted to 5 the first time load is judged.
pub fn next_concurrency(current: usize, load: &SystemLoad) -> usize {
    let next = if load.cpu_percent > CPU_HIGH_PERCENT || load.memory_percent > MEMORY_HIGH_PERCENT
    {
        (current as f64 * SHRINK_FACTOR).floor() as usize
    } else if load.cpu_percent < CPU_LOW_PERCENT
        && load.memory_percent < MEMORY_LOW_PERCENT
        && load.network_latency_ms < LATENCY_LOW_MS
    {
        (current as f64 * GROW_FACTOR).floor() as usize
    } else {
        current
    };
    next.clamp(Config::MIN_CONCURRENCY, Config::MAX_CONCURRENCY)
}

/// Reads CPU and memory figures from the host and from this process.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Returns host-wide `(used, total)` memory in bytes.
    pub fn memory(&self) -> (u64, u64) {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        (system.used_memory(), system.total_memory())
    }

    /// Host-wide memory use as a percentage; the adaptive rule's input.
    pub fn memory_percent(&self) -> f64 {
        match self.memory() {
            (_, 0) => 0.0,
            (used, total) => used as f64 / total as f64 * 100.0,
        }
    }

    /// Resident memory of this process in bytes, 0 when it cannot be read.
    pub fn process_memory(&self) -> u64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0;
        };
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    /// This process's resident memory as a percentage of host memory.
    pub fn process_memory_percent(&self) -> f64 {
        let used = self.process_memory();
        match self.memory() {
            (_, 0) => 0.0,
            (_, total) => used as f64 / total as f64 * 100.0,
        }
    }

    /// Samples CPU and memory use.
    ///
    /// CPU usage is a delta between two refreshes, so this waits
    /// [`sysinfo::MINIMUM_CPU_UPDATE_INTERVAL`] between them.
    pub async fn sample(&self, network_latency_ms: u64) -> SystemLoad {
        self.system
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh_cpu_usage();

        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

        let cpu_percent = {
            let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_cpu_usage();
            f64::from(system.global_cpu_usage())
        };

        SystemLoad {
            cpu_percent,
            memory_percent: self.memory_percent(),
            network_latency_ms,
        }
    }
}

impl ParallelProcessor {
    /// Retunes `max_concurrency` from a load snapshot.
    ///
    /// The new value applies to batches started after this call; a batch
    /// already in progress keeps the worker count it started with.
    pub fn adaptive_concurrency_control(&self, load: &SystemLoad) -> ConcurrencyConfig {
        let current = self.max_concurrency();
        let next = next_concurrency(current, load);

        if next != current {
            tracing::info!(
                from = current,
                to = next,
                cpu = load.cpu_percent,
                memory = load.memory_percent,
                latency_ms = load.network_latency_ms,
                "Adjusted max concurrency"
            );
            self.set_max_concurrency(next);
        }

        ConcurrencyConfig {
            max_concurrency: next,
            cpu_threshold: CPU_HIGH_PERCENT,
            memory_threshold: MEMORY_HIGH_PERCENT,
            network_threshold_ms: LATENCY_LOW_MS,
        }
    }

    /// Samples host load and feeds it to [`Self::adaptive_concurrency_control`].
    pub async fn sample_and_adapt(&self) -> ConcurrencyConfig {
        let latency = self.connections().average_latency().as_millis() as u64;
        let load = self.probe().sample(latency).await;
        self.adaptive_concurrency_control(&load)
    }
}
