//! Error kinds for the checkpoint engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the checkpoint engine.
///
/// `ConfigInvalid` and `DeviceUnavailable` are fatal at construction time.
/// `SerializeFailed`/`IoFailed` are captured in the engine's error slot and
/// surfaced at the next `wait()`/`commit()`. `CorruptHeader`, `KeyMismatch`
/// and `VersionRegression` are returned directly from a failed `load()`;
/// the engine remains usable afterwards.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("requested {requested} bytes but arena capacity is {capacity} bytes")]
    OutOfCapacity { requested: usize, capacity: usize },

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("failed to serialize state tree: {0}")]
    SerializeFailed(String),

    #[error("I/O failure on {path}: {source}")]
    IoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt checkpoint header in {path}: {reason}")]
    CorruptHeader { path: PathBuf, reason: String },

    #[error("key mismatch at `{key}`: expected placeholder `TENSOR|{key}`, found `{found}`")]
    KeyMismatch { key: String, found: String },

    #[error("version regression on {path}: attempted {attempted}, last written {last}")]
    VersionRegression {
        path: PathBuf,
        attempted: u64,
        last: u64,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
