//! Frequency controller: chooses strategy + checkpoint cadence, persists
//! the decision, and reacts to overhead drift.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Strategy;
use crate::error::{EngineError, Result};
use crate::profiler::ProfileReport;

/// Controller lifecycle: `IDLE -> PROFILING` on the first step,
/// `PROFILING -> STEADY` once the measurement window closes,
/// `STEADY -> ADAPTING -> STEADY` on overshoot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Profiling,
    Steady,
    Adapting,
}

pub enum ControllerEvent {
    FirstStep,
    WindowClosed,
    Overshoot,
    Recalibrated,
}

impl ControllerState {
    pub fn transition(self, event: ControllerEvent) -> Self {
        use ControllerEvent::*;
        use ControllerState::*;
        match (self, event) {
            (Idle, FirstStep) => Profiling,
            (Profiling, WindowClosed) => Steady,
            (Steady, Overshoot) => Adapting,
            (Adapting, Recalibrated) => Steady,
            (other, _) => other,
        }
    }
}

/// The decision produced by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub strategy: Strategy,
    pub background: bool,
    pub chk_freq: u32,
    pub avg_iter_dur: Duration,
}

/// Picks a snapshot strategy and checkpoint cadence from a profile report.
pub fn decide(report: &ProfileReport, _max_overhead_pct: f64) -> Decision {
    let device_feasible = report.checkpoint_bytes <= report.free_device_bytes;
    let (strategy, overhead, t_f) =
        if device_feasible && report.device.snapshot_cost <= report.host.snapshot_cost {
            (
                Strategy::Device,
                report.device.snapshot_cost,
                report.device.total_flush_cost,
            )
        } else {
            (
                Strategy::Host,
                report.host.snapshot_cost,
                report.host.total_flush_cost,
            )
        };

    let t_i = report.mean_iter_time;
    let chk_freq = if t_i.is_zero() {
        1
    } else {
        let remaining = t_f.saturating_sub(overhead);
        let steps = (remaining.as_secs_f64() / t_i.as_secs_f64()).ceil();
        (steps as u32).max(1)
    };

    Decision {
        strategy,
        background: true,
        chk_freq,
        avg_iter_dur: t_i,
    }
}

/// On-disk schema for the per-architecture, per-batch-size cache-decision
/// file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDecisionFile {
    pub avg_iter_dur: f64,
    pub chk_freq: u32,
    pub chk_strategy: String,
    pub use_background_thread: bool,
}

impl CacheDecisionFile {
    fn from_decision(decision: &Decision) -> Self {
        Self {
            avg_iter_dur: decision.avg_iter_dur.as_secs_f64(),
            chk_freq: decision.chk_freq,
            chk_strategy: match decision.strategy {
                Strategy::Host => "host".to_string(),
                Strategy::Device => "device".to_string(),
            },
            use_background_thread: decision.background,
        }
    }
}

pub fn cache_file_path(dir: &Path, arch: &str, batch: usize) -> PathBuf {
    dir.join(format!(".cache_{arch}_{batch}"))
}

/// Writes the cache-decision file atomically: temp file, fsync, rename.
pub fn cache_decision(path: &Path, decision: &Decision) -> Result<()> {
    let payload = CacheDecisionFile::from_decision(decision);
    let bytes = serde_json::to_vec(&payload).map_err(|e| EngineError::SerializeFailed(e.to_string()))?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &bytes).map_err(|source| EngineError::IoFailed {
        path: tmp_path.clone(),
        source,
    })?;
    let tmp_file = File::open(&tmp_path).map_err(|source| EngineError::IoFailed {
        path: tmp_path.clone(),
        source,
    })?;
    tmp_file.sync_all().map_err(|source| EngineError::IoFailed {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| EngineError::IoFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Loads a previously-cached decision, if one exists for this
/// architecture/batch-size pair. Returns `None` on a fresh run.
pub fn load_cached_decision(path: &Path) -> Result<Option<CacheDecisionFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path).map_err(|source| EngineError::IoFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let decision: CacheDecisionFile =
        serde_json::from_slice(&bytes).map_err(|e| EngineError::SerializeFailed(e.to_string()))?;
    Ok(Some(decision))
}

/// Owns controller state across the life of a training run: the chosen
/// strategy/cadence, and the overshoot-adaptation control loop.
pub struct FrequencyController {
    state: ControllerState,
    max_overhead_pct: f64,
    chk_freq: u32,
    strategy: Strategy,
    background: bool,
    baseline_iter: Duration,
}

impl FrequencyController {
    pub fn new(max_overhead_pct: f64) -> Self {
        Self {
            state: ControllerState::Idle,
            max_overhead_pct,
            chk_freq: 1,
            strategy: Strategy::Host,
            background: true,
            baseline_iter: Duration::ZERO,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn chk_freq(&self) -> u32 {
        self.chk_freq
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn background(&self) -> bool {
        self.background
    }

    pub fn start(&mut self) {
        self.state = self.state.transition(ControllerEvent::FirstStep);
    }

    /// Applies a freshly-closed profiling window's decision, transitioning
    /// the controller to `Steady`.
    pub fn apply_profile(&mut self, report: &ProfileReport) -> Decision {
        let decision = decide(report, self.max_overhead_pct);
        self.chk_freq = decision.chk_freq;
        self.strategy = decision.strategy;
        self.background = decision.background;
        self.baseline_iter = decision.avg_iter_dur;
        self.state = self.state.transition(ControllerEvent::WindowClosed);
        decision
    }

    /// Feeds one realized-window mean iteration time through the
    /// overshoot check. Returns `true` if `chk_freq` was bumped.
    pub fn observe_window(&mut self, realized_mean_iter: Duration) -> bool {
        if self.baseline_iter.is_zero() {
            return false;
        }
        let baseline_total = self.baseline_iter.as_secs_f64() * self.chk_freq as f64;
        let realized_total = realized_mean_iter.as_secs_f64() * self.chk_freq as f64;
        let overhead_pct = (realized_total - baseline_total) / baseline_total * 100.0;

        if overhead_pct > self.max_overhead_pct {
            self.state = self.state.transition(ControllerEvent::Overshoot);
            self.chk_freq += 2;
            self.state = self.state.transition(ControllerEvent::Recalibrated);
            tracing::warn!(
                overhead_pct,
                new_chk_freq = self.chk_freq,
                "checkpoint overhead exceeded budget, backing off cadence"
            );
            true
        } else {
            false
        }
    }
}
