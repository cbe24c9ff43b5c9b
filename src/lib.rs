//! Adaptive checkpoint engine: serializes nested state dicts to
//! self-describing disk blobs, stages tensors through a bounded pinned-host
//! cache to overlap device-to-disk transfer, and adaptively chooses
//! checkpoint frequency under an overhead budget.
//!
//! The pieces, in dependency order:
//!
//! - [`tensor`] / [`value`]: tensor and state-dict value types.
//! - [`header`]: the on-disk header format.
//! - [`cache`]: the bounded pinned-host staging arena.
//! - [`io_pool`]: the async disk-flush worker pool.
//! - [`parser`]: flattens a state dict into tensor records plus a scalar
//!   tree.
//! - [`engine`]: the `save`/`load`/`commit`/`wait` facade.
//! - [`profiler`] / [`controller`]: adaptive cadence selection.
//! - [`iterator`]: wraps a training-step iterator to drive the above.
//! - [`config`]: on-disk configuration knobs.
//! - [`diagnostics`]: best-effort CSV side files.

pub mod cache;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod header;
pub mod io_pool;
pub mod iterator;
pub mod parser;
pub mod profiler;
pub mod scalar_codec;
pub mod tensor;
pub mod value;

pub use config::{EngineConfig, Strategy};
pub use controller::{
    CacheDecisionFile, ControllerEvent, ControllerState, Decision, FrequencyController,
};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use iterator::{IteratorState, TrainingStepIterator};
pub use profiler::{DeviceMemoryInfo, ProfileReport, Profiler, StrategyCost};
pub use tensor::{DType, DeviceOps, DeviceTensorHandle, HostTensor, TensorLike};
pub use value::{
    tensor_placeholder, OpaqueValue, RestoredValue, ScalarTree, ScalarValue, StateValue,
    TensorLeaf, TensorSource, KEY_SEPARATOR,
};
