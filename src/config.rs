//! Operational knobs, TOML-backed.
//!
//! Every field gets its own `default_x()` free function wired through
//! `#[serde(default = "default_x")]`, rather than a single blanket
//! `#[derive(Default)]`, so each knob's default is documented next to its
//! definition.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Host,
    Device,
}

pub fn default_host_cache_bytes() -> usize {
    64 * 1024 * 1024
}

pub fn default_parser_threads() -> usize {
    4
}

pub fn default_io_workers() -> usize {
    2
}

pub fn default_chk_freq() -> u32 {
    0
}

pub fn default_max_overhead_pct() -> f64 {
    5.0
}

pub fn default_adaptive() -> bool {
    true
}

pub fn default_persist() -> bool {
    true
}

pub fn default_strategy_override() -> Option<Strategy> {
    None
}

pub fn default_profile_warmup() -> usize {
    5
}

pub fn default_profile_window() -> usize {
    95
}

/// Engine construction and run-time behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_host_cache_bytes")]
    pub host_cache_bytes: usize,

    #[serde(default = "default_parser_threads")]
    pub parser_threads: usize,

    #[serde(default = "default_io_workers")]
    pub io_workers: usize,

    /// Explicit cadence; 0 disables iter-level saves (the training-step
    /// iterator then relies entirely on the controller, or the caller
    /// drives `save` manually).
    #[serde(default = "default_chk_freq")]
    pub chk_freq: u32,

    #[serde(default = "default_max_overhead_pct")]
    pub max_overhead_pct: f64,

    #[serde(default = "default_adaptive")]
    pub adaptive: bool,

    #[serde(default = "default_persist")]
    pub persist: bool,

    #[serde(default = "default_strategy_override")]
    pub strategy_override: Option<Strategy>,

    #[serde(default = "default_profile_warmup")]
    pub profile_warmup: usize,

    #[serde(default = "default_profile_window")]
    pub profile_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_cache_bytes: default_host_cache_bytes(),
            parser_threads: default_parser_threads(),
            io_workers: default_io_workers(),
            chk_freq: default_chk_freq(),
            max_overhead_pct: default_max_overhead_pct(),
            adaptive: default_adaptive(),
            persist: default_persist(),
            strategy_override: default_strategy_override(),
            profile_warmup: default_profile_warmup(),
            profile_window: default_profile_window(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(text).map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_cache_bytes == 0 {
            return Err(EngineError::ConfigInvalid(
                "host_cache_bytes must be > 0".to_string(),
            ));
        }
        if self.parser_threads == 0 {
            return Err(EngineError::ConfigInvalid(
                "parser_threads must be > 0".to_string(),
            ));
        }
        if self.io_workers == 0 {
            return Err(EngineError::ConfigInvalid(
                "io_workers must be > 0".to_string(),
            ));
        }
        if self.max_overhead_pct < 0.0 {
            return Err(EngineError::ConfigInvalid(
                "max_overhead_pct must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}
