//! On-disk header schema.
//!
//! ```text
//! [0, 8)                  : header_size (uint64, little-endian)
//! [8, 8+header_size)      : UTF-8 JSON header
//! [8+header_size, …)      : tensor payload regions + scalar-tree region
//! ```

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::tensor::DType;

pub const SIZE_PREFIX_BYTES: usize = 8;
pub const META_KEY: &str = "__meta__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorHeaderEntry {
    pub dtype: String,
    pub shape: Vec<usize>,
    pub data_offsets: [u64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetaHeaderEntry {
    pub data_offsets: [u64; 2],
}

/// The parsed header: an ordered map of dotted-path -> tensor entry, plus
/// the reserved `__meta__` entry for the scalar tree's byte range.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub tensors: IndexMap<String, TensorHeaderEntry>,
    pub meta: MetaHeaderEntry,
}

impl Header {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        // JSON key order follows insertion order for a `serde_json::Map`
        // only when the `preserve_order` feature is enabled; we build an
        // explicit `BTreeMap`-free ordered `serde_json::Value` instead so
        // two serializations of the same tree are byte-identical modulo
        // the reserved key.
        let mut obj = serde_json::Map::new();
        for (key, entry) in &self.tensors {
            obj.insert(key.clone(), serde_json::to_value(entry).unwrap());
        }
        obj.insert(
            META_KEY.to_string(),
            serde_json::to_value(&self.meta).unwrap(),
        );
        serde_json::to_vec(&serde_json::Value::Object(obj))
            .map_err(|e| EngineError::SerializeFailed(e.to_string()))
    }

    pub fn from_bytes(path: &std::path::Path, bytes: &[u8]) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(bytes).map_err(|e| EngineError::CorruptHeader {
                path: path.to_path_buf(),
                reason: format!("header is not valid JSON: {e}"),
            })?;

        let meta_value = raw.get(META_KEY).ok_or_else(|| EngineError::CorruptHeader {
            path: path.to_path_buf(),
            reason: format!("missing reserved `{META_KEY}` entry"),
        })?;
        let meta: MetaHeaderEntry =
            serde_json::from_value(meta_value.clone()).map_err(|e| EngineError::CorruptHeader {
                path: path.to_path_buf(),
                reason: format!("malformed `{META_KEY}` entry: {e}"),
            })?;

        let mut tensors = IndexMap::new();
        for (key, value) in raw {
            if key == META_KEY {
                continue;
            }
            let entry: TensorHeaderEntry =
                serde_json::from_value(value).map_err(|e| EngineError::CorruptHeader {
                    path: path.to_path_buf(),
                    reason: format!("malformed entry for `{key}`: {e}"),
                })?;
            tensors.insert(key, entry);
        }

        Ok(Header { tensors, meta })
    }
}

pub fn normalize_dtype(raw: &str) -> Option<DType> {
    DType::parse_normalized(raw)
}

pub fn encode_size_prefix(header_len: usize) -> [u8; SIZE_PREFIX_BYTES] {
    (header_len as u64).to_le_bytes()
}

pub fn decode_size_prefix(bytes: &[u8; SIZE_PREFIX_BYTES]) -> u64 {
    u64::from_le_bytes(*bytes)
}
