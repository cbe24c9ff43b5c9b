//! The state value tree.
//!
//! Five variants: tensor leaf, mapping node, sequence node, scalar leaf,
//! opaque leaf. Keys must not contain the reserved separator `|`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, HostTensor};

/// The separator used to build dotted paths (`meta|lrs|0`).
pub const KEY_SEPARATOR: char = '|';

/// Any plain value that round-trips through the scalar codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// Anything that is neither a tensor, a mapping, a sequence, nor a plain
/// scalar, but still implements `Serialize`/`Deserialize`. Encoded with
/// the same generic codec as scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueValue(pub Vec<u8>);

/// A node in the state value tree.
#[derive(Debug)]
pub enum StateValue {
    Tensor(TensorLeaf),
    Map(IndexMap<String, StateValue>),
    Seq(Vec<StateValue>),
    Scalar(ScalarValue),
    Opaque(OpaqueValue),
}

/// A tensor leaf as it exists in the live (pre-serialization) tree. This
/// crate does not know how to copy an arbitrary framework tensor, so
/// callers hand over bytes already read to the host, or a boxed
/// [`crate::tensor::TensorLike`] for the device-resident path.
pub struct TensorLeaf {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub source: TensorSource,
}

pub enum TensorSource {
    Host(HostTensor),
    Device(Box<dyn crate::tensor::TensorLike + Send + Sync>),
}

impl std::fmt::Debug for TensorLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorLeaf")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish()
    }
}

impl StateValue {
    pub fn map() -> Self {
        StateValue::Map(IndexMap::new())
    }

    pub fn tensor(tensor: HostTensor) -> Self {
        StateValue::Tensor(TensorLeaf {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            source: TensorSource::Host(tensor),
        })
    }

    pub fn scalar(v: impl Into<ScalarValue>) -> Self {
        StateValue::Scalar(v.into())
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}
impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float(v)
    }
}
impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}
impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Str(v)
    }
}
impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Str(v.to_string())
    }
}

use crate::tensor::TensorLike;

/// The scalar tree: the state value tree with every tensor leaf replaced
/// by its `TENSOR|<dotted-path>` placeholder. This is what actually gets
/// serialized into the `__meta__` byte range of the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarTree {
    Map(IndexMap<String, ScalarTree>),
    Seq(Vec<ScalarTree>),
    Scalar(ScalarValue),
    Opaque(OpaqueValue),
}

impl ScalarTree {
    /// Looks up the value at a dotted path (used to verify placeholder
    /// correctness).
    pub fn get_path(&self, path: &str) -> Option<&ScalarTree> {
        let mut cur = self;
        if path.is_empty() {
            return Some(cur);
        }
        for segment in path.split(KEY_SEPARATOR) {
            cur = match cur {
                ScalarTree::Map(m) => m.get(segment)?,
                ScalarTree::Seq(s) => s.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    pub fn as_placeholder(&self) -> Option<&str> {
        match self {
            ScalarTree::Scalar(ScalarValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A fully-restored value tree, produced by [`crate::engine::Engine::load`]:
/// every placeholder has been spliced back into a concrete [`HostTensor`].
#[derive(Debug, Clone, PartialEq)]
pub enum RestoredValue {
    Tensor(HostTensor),
    Map(IndexMap<String, RestoredValue>),
    Seq(Vec<RestoredValue>),
    Scalar(ScalarValue),
    Opaque(OpaqueValue),
}

/// Placeholder string for a tensor at `dotted_path`.
pub fn tensor_placeholder(dotted_path: &str) -> String {
    format!("TENSOR{KEY_SEPARATOR}{dotted_path}")
}

