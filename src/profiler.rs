//! Profiler: warmup + measurement window, then two profile-only engine
//! invocations to measure per-strategy snapshot cost.

use std::time::Duration;

use crate::config::Strategy;

/// Free/peak device memory, queried through a narrow seam so the profiler
/// never talks to a concrete compute backend directly (this is where a
/// real `burn`/`tch` backend plugs in, the same seam `DeviceOps` gives
/// `tensor.rs`).
pub trait DeviceMemoryInfo {
    fn free_bytes(&self) -> usize;
    fn peak_bytes(&self) -> usize;
}

/// Result of one profile-only engine invocation: a snapshot-only cost and
/// a total-flush cost for one strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyCost {
    /// Snapshot-only cost: time to copy tensors into the staging medium.
    pub snapshot_cost: Duration,
    /// Total-flush cost: time until the checkpoint is fully durable.
    pub total_flush_cost: Duration,
}

/// Everything the frequency controller needs to make its decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileReport {
    pub mean_iter_time: Duration,
    pub peak_device_bytes: usize,
    pub free_device_bytes: usize,
    pub checkpoint_bytes: usize,
    pub host: StrategyCost,
    pub device: StrategyCost,
}

/// Observes a configurable number of warmup iterations, then a
/// measurement window, accumulating per-iteration durations.
pub struct Profiler {
    warmup: usize,
    window: usize,
    seen: usize,
    durations: Vec<Duration>,
    peak_device_bytes: usize,
    free_device_bytes: usize,
}

impl Profiler {
    pub fn new(warmup: usize, window: usize) -> Self {
        Self {
            warmup,
            window,
            seen: 0,
            durations: Vec::with_capacity(window),
            peak_device_bytes: 0,
            free_device_bytes: 0,
        }
    }

    /// True while still in the warmup phase.
    pub fn is_warming_up(&self) -> bool {
        self.seen < self.warmup
    }

    /// True once the measurement window has filled.
    pub fn is_window_closed(&self) -> bool {
        self.seen >= self.warmup + self.window
    }

    /// Records one training-step duration. Warmup iterations are counted
    /// but excluded from `t_i`.
    pub fn record_iter(&mut self, duration: Duration) {
        self.seen += 1;
        if self.seen > self.warmup {
            self.durations.push(duration);
        }
    }

    pub fn record_memory(&mut self, peak: usize, free: usize) {
        self.peak_device_bytes = self.peak_device_bytes.max(peak);
        self.free_device_bytes = free;
    }

    fn mean_iter_time(&self) -> Duration {
        if self.durations.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.durations.iter().sum();
        total / self.durations.len() as u32
    }

    /// Closes the measurement window, running two profile-only invocations
    /// of `probe` (one per strategy) to measure snapshot cost. `probe` is
    /// supplied by the caller because only it knows how to drive an
    /// `Engine` in profile-only mode against real state.
    pub fn finish(
        &self,
        checkpoint_bytes: usize,
        mut probe: impl FnMut(Strategy) -> StrategyCost,
    ) -> ProfileReport {
        ProfileReport {
            mean_iter_time: self.mean_iter_time(),
            peak_device_bytes: self.peak_device_bytes,
            free_device_bytes: self.free_device_bytes,
            checkpoint_bytes,
            host: probe(Strategy::Host),
            device: probe(Strategy::Device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_iterations_are_excluded_from_mean() {
        let mut profiler = Profiler::new(2, 3);
        profiler.record_iter(Duration::from_millis(1000)); // warmup
        profiler.record_iter(Duration::from_millis(1000)); // warmup
        assert!(!profiler.is_warming_up());
        profiler.record_iter(Duration::from_millis(10));
        profiler.record_iter(Duration::from_millis(20));
        profiler.record_iter(Duration::from_millis(30));
        assert!(profiler.is_window_closed());
        assert_eq!(profiler.mean_iter_time(), Duration::from_millis(20));
    }

    #[test]
    fn finish_invokes_probe_for_both_strategies() {
        let profiler = Profiler::new(0, 1);
        let mut seen = Vec::new();
        let report = profiler.finish(1024, |strategy| {
            seen.push(strategy);
            StrategyCost {
                snapshot_cost: Duration::from_millis(1),
                total_flush_cost: Duration::from_millis(2),
            }
        });
        assert_eq!(seen, vec![Strategy::Host, Strategy::Device]);
        assert_eq!(report.checkpoint_bytes, 1024);
    }
}
