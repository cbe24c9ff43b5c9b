//! Training-step iterator: a thin wrapper around an underlying data
//! iterator that drives the profiler and frequency controller, and
//! invokes the checkpoint engine at the chosen cadence.

use std::path::PathBuf;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::controller::FrequencyController;
use crate::engine::Engine;
use crate::parser::parse_state;
use crate::profiler::{Profiler, StrategyCost};
use crate::scalar_codec;
use crate::value::StateValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    PreProfile,
    Profile,
    Steady,
    EpochBoundary,
    Terminal,
}

/// Wraps `inner`, calling `state_provider` to obtain a fresh state-dict
/// snapshot only at the moments a checkpoint is actually due. This keeps
/// the iterator decoupled from model/optimizer internals.
pub struct TrainingStepIterator<I, F>
where
    I: Iterator,
    F: FnMut() -> StateValue,
{
    inner: I,
    engine: Engine,
    controller: FrequencyController,
    profiler: Profiler,
    state_provider: F,
    checkpoint_path: PathBuf,
    rank: u32,
    step: u64,
    steps_to_run: Option<u64>,
    since_checkpoint: u32,
    state: IteratorState,
}

impl<I, F> TrainingStepIterator<I, F>
where
    I: Iterator,
    F: FnMut() -> StateValue,
{
    pub fn new(
        inner: I,
        engine: Engine,
        config: &EngineConfig,
        rank: u32,
        checkpoint_path: PathBuf,
        steps_to_run: Option<u64>,
        state_provider: F,
    ) -> Self {
        Self {
            inner,
            engine,
            controller: FrequencyController::new(config.max_overhead_pct),
            profiler: Profiler::new(config.profile_warmup, config.profile_window),
            state_provider,
            checkpoint_path,
            rank,
            step: 0,
            steps_to_run,
            since_checkpoint: 0,
            state: IteratorState::PreProfile,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn iterator_state(&self) -> IteratorState {
        self.state
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Advances one training step. Only rank 0 runs profiling, control,
    /// and issues saves; other ranks delegate but still maintain their
    /// own step counters.
    pub fn next_step(&mut self) -> Option<I::Item> {
        if self.state == IteratorState::Terminal {
            return None;
        }

        let step_start = Instant::now();
        let item = self.inner.next();

        if item.is_none() {
            // Force a synchronous durable checkpoint unconditionally,
            // even if the controller just checkpointed on the previous
            // step.
            if self.rank == 0 {
                self.force_epoch_boundary_checkpoint();
            }
            self.state = IteratorState::EpochBoundary;
            return None;
        }

        self.step += 1;
        if self.rank == 0 {
            self.drive_rank_zero(step_start.elapsed());
        }

        if let Some(limit) = self.steps_to_run {
            if self.step >= limit {
                self.state = IteratorState::Terminal;
            }
        }

        item
    }

    fn drive_rank_zero(&mut self, step_duration: std::time::Duration) {
        match self.state {
            IteratorState::PreProfile => {
                self.profiler.record_iter(step_duration);
                if !self.profiler.is_warming_up() {
                    self.controller.start();
                    self.state = IteratorState::Profile;
                }
            }
            IteratorState::Profile => {
                self.profiler.record_iter(step_duration);
                if self.profiler.is_window_closed() {
                    self.complete_profile();
                    self.state = IteratorState::Steady;
                }
            }
            IteratorState::Steady => {
                let chk_freq = self.controller.chk_freq();
                if chk_freq > 0 {
                    self.since_checkpoint += 1;
                    if self.since_checkpoint >= chk_freq {
                        self.checkpoint_now();
                        self.since_checkpoint = 0;
                    }
                }
            }
            IteratorState::EpochBoundary | IteratorState::Terminal => {}
        }
    }

    fn complete_profile(&mut self) {
        let state = (self.state_provider)();
        let checkpoint_bytes = estimate_checkpoint_bytes(&state);
        let scratch_path = self.checkpoint_path.with_extension("profile");
        let engine = &self.engine;

        let report = self.profiler.finish(checkpoint_bytes, |strategy| {
            let start = Instant::now();
            if let Err(err) = engine.save(&state, &scratch_path, strategy) {
                tracing::warn!(error = %err, ?strategy, "profile-only save failed");
                return StrategyCost {
                    snapshot_cost: start.elapsed(),
                    total_flush_cost: start.elapsed(),
                };
            }
            let snapshot_cost = start.elapsed();
            let _ = engine.wait();
            let total_flush_cost = start.elapsed();
            StrategyCost {
                snapshot_cost,
                total_flush_cost,
            }
        });

        let decision = self.controller.apply_profile(&report);
        tracing::info!(?decision, "frequency controller calibrated");
    }

    fn checkpoint_now(&mut self) {
        let state = (self.state_provider)();
        let strategy = self.controller.strategy();
        if let Err(err) = self.engine.save(&state, &self.checkpoint_path, strategy) {
            tracing::warn!(error = %err, "scheduled checkpoint save failed");
        }
    }

    fn force_epoch_boundary_checkpoint(&mut self) {
        let state = (self.state_provider)();
        let strategy = self.controller.strategy();
        if let Err(err) = self.engine.save(&state, &self.checkpoint_path, strategy) {
            tracing::warn!(error = %err, "epoch-boundary save failed");
            return;
        }
        if let Err(err) = self.engine.commit() {
            tracing::warn!(error = %err, "epoch-boundary commit failed");
        }
    }
}

fn estimate_checkpoint_bytes(state: &StateValue) -> usize {
    let parsed = parse_state(state);
    let tensor_bytes: usize = parsed.tensor_records.iter().map(|r| r.bytes.len()).sum();
    let meta_bytes = scalar_codec::encode(&parsed.scalar_tree)
        .map(|b| b.len())
        .unwrap_or(0);
    tensor_bytes + meta_bytes
}
