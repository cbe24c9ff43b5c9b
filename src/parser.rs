//! State-dict parser: walks a nested state value tree depth-first,
//! producing a scalar tree (tensors replaced by placeholders) and an
//! ordered list of tensor records with monotonically assigned
//! `[start, end)` byte offsets.

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::error::{EngineError, Result};
use crate::tensor::{DType, TensorLike};
use crate::value::{
    tensor_placeholder, OpaqueValue, RestoredValue, ScalarTree, ScalarValue, StateValue,
    TensorSource, KEY_SEPARATOR,
};

/// One tensor leaf discovered while walking the tree, with its assigned
/// byte range relative to the start of the tensor-payload region (offsets
/// are rebased to absolute file offsets by the caller once the header
/// size is known).
pub struct TensorRecord<'a> {
    pub dotted_path: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub start: u64,
    pub end: u64,
    pub bytes: Cow<'a, [u8]>,
}

pub struct ParsedState<'a> {
    pub scalar_tree: ScalarTree,
    pub tensor_records: Vec<TensorRecord<'a>>,
}

/// Walks `value` depth-first, assigning offsets starting at 0 (the
/// caller rebases these once the header size is known).
pub fn parse_state(value: &StateValue) -> ParsedState<'_> {
    let mut records = Vec::new();
    let mut cursor: u64 = 0;
    let scalar_tree = walk("", value, &mut cursor, &mut records);
    ParsedState {
        scalar_tree,
        tensor_records: records,
    }
}

fn walk<'a>(
    prefix: &str,
    value: &'a StateValue,
    cursor: &mut u64,
    records: &mut Vec<TensorRecord<'a>>,
) -> ScalarTree {
    match value {
        StateValue::Tensor(leaf) => {
            let bytes: Cow<'a, [u8]> = match &leaf.source {
                TensorSource::Host(t) => match t.contiguous_bytes() {
                    Cow::Borrowed(b) => Cow::Borrowed(b),
                    Cow::Owned(b) => Cow::Owned(b),
                },
                TensorSource::Device(t) => Cow::Owned(t.contiguous_bytes().into_owned()),
            };
            let start = *cursor;
            let end = start + bytes.len() as u64;
            *cursor = end;
            records.push(TensorRecord {
                dotted_path: prefix.to_string(),
                dtype: leaf.dtype,
                shape: leaf.shape.clone(),
                start,
                end,
                bytes,
            });
            ScalarTree::Scalar(ScalarValue::Str(tensor_placeholder(prefix)))
        }
        StateValue::Map(map) => {
            let mut out = IndexMap::new();
            for (key, child) in map {
                debug_assert!(
                    !key.contains(KEY_SEPARATOR),
                    "keys must not contain the reserved separator"
                );
                let child_prefix = join_path(prefix, key);
                out.insert(key.clone(), walk(&child_prefix, child, cursor, records));
            }
            ScalarTree::Map(out)
        }
        StateValue::Seq(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for (idx, child) in seq.iter().enumerate() {
                let child_prefix = join_path(prefix, &idx.to_string());
                out.push(walk(&child_prefix, child, cursor, records));
            }
            ScalarTree::Seq(out)
        }
        StateValue::Scalar(s) => ScalarTree::Scalar(s.clone()),
        StateValue::Opaque(o) => ScalarTree::Opaque(OpaqueValue(o.0.clone())),
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}{KEY_SEPARATOR}{segment}")
    }
}

/// Converts a loaded scalar tree (no tensors yet) into a restored value
/// tree with the same shape, placeholders still in place.
pub fn scalar_tree_to_restored(tree: ScalarTree) -> RestoredValue {
    match tree {
        ScalarTree::Map(m) => {
            RestoredValue::Map(m.into_iter().map(|(k, v)| (k, scalar_tree_to_restored(v))).collect())
        }
        ScalarTree::Seq(s) => {
            RestoredValue::Seq(s.into_iter().map(scalar_tree_to_restored).collect())
        }
        ScalarTree::Scalar(v) => RestoredValue::Scalar(v),
        ScalarTree::Opaque(v) => RestoredValue::Opaque(v),
    }
}

/// Replaces the placeholder at `dotted_path` with `tensor`, verifying
/// that the value currently at that position is exactly
/// `TENSOR|<dotted_path>` (fatal `KeyMismatch` otherwise).
pub fn splice_tensor(
    root: &mut RestoredValue,
    dotted_path: &str,
    tensor: crate::tensor::HostTensor,
) -> Result<()> {
    let expected = tensor_placeholder(dotted_path);
    let mut cur = root;
    let segments: Vec<&str> = if dotted_path.is_empty() {
        vec![]
    } else {
        dotted_path.split(KEY_SEPARATOR).collect()
    };

    let Some((last, ancestors)) = segments.split_last() else {
        return Err(EngineError::KeyMismatch {
            key: dotted_path.to_string(),
            found: "<root>".to_string(),
        });
    };

    for segment in ancestors {
        cur = match cur {
            RestoredValue::Map(m) => m.get_mut(*segment).ok_or_else(|| EngineError::KeyMismatch {
                key: dotted_path.to_string(),
                found: format!("missing segment `{segment}`"),
            })?,
            RestoredValue::Seq(s) => {
                let idx: usize = segment.parse().map_err(|_| EngineError::KeyMismatch {
                    key: dotted_path.to_string(),
                    found: format!("non-numeric index `{segment}`"),
                })?;
                s.get_mut(idx).ok_or_else(|| EngineError::KeyMismatch {
                    key: dotted_path.to_string(),
                    found: format!("missing index `{idx}`"),
                })?
            }
            _ => {
                return Err(EngineError::KeyMismatch {
                    key: dotted_path.to_string(),
                    found: "non-container ancestor".to_string(),
                })
            }
        };
    }

    let slot = match cur {
        RestoredValue::Map(m) => m.get_mut(*last).ok_or_else(|| EngineError::KeyMismatch {
            key: dotted_path.to_string(),
            found: format!("missing segment `{last}`"),
        })?,
        RestoredValue::Seq(s) => {
            let idx: usize = last.parse().map_err(|_| EngineError::KeyMismatch {
                key: dotted_path.to_string(),
                found: format!("non-numeric index `{last}`"),
            })?;
            s.get_mut(idx).ok_or_else(|| EngineError::KeyMismatch {
                key: dotted_path.to_string(),
                found: format!("missing index `{idx}`"),
            })?
        }
        _ => {
            return Err(EngineError::KeyMismatch {
                key: dotted_path.to_string(),
                found: "non-container ancestor".to_string(),
            })
        }
    };

    match slot {
        RestoredValue::Scalar(ScalarValue::Str(found)) if *found == expected => {
            *slot = RestoredValue::Tensor(tensor);
            Ok(())
        }
        other => Err(EngineError::KeyMismatch {
            key: dotted_path.to_string(),
            found: format!("{other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::HostTensor;
    use crate::value::ScalarValue;

    fn sample_tree() -> StateValue {
        let mut meta = IndexMap::new();
        meta.insert("epoch".to_string(), StateValue::scalar(7i64));
        meta.insert(
            "lrs".to_string(),
            StateValue::Seq(vec![StateValue::scalar(0.1f64), StateValue::scalar(0.01f64)]),
        );

        let mut root = IndexMap::new();
        root.insert(
            "w".to_string(),
            StateValue::tensor(HostTensor::new(
                DType::Float32,
                vec![2, 3],
                (1..=6u8).flat_map(|b| (b as f32).to_le_bytes()).collect(),
            )),
        );
        root.insert("meta".to_string(), StateValue::Map(meta));
        StateValue::Map(root)
    }

    #[test]
    fn only_tensor_leaves_register_in_header() {
        let tree = sample_tree();
        let parsed = parse_state(&tree);
        let paths: Vec<_> = parsed
            .tensor_records
            .iter()
            .map(|r| r.dotted_path.clone())
            .collect();
        assert_eq!(paths, vec!["w".to_string()]);
        // Scalar siblings such as meta|lrs|0 are not tensor records.
        assert!(parsed
            .scalar_tree
            .get_path("meta|lrs|0")
            .unwrap()
            .as_placeholder()
            .is_none());
    }

    #[test]
    fn placeholder_matches_dotted_path() {
        let tree = sample_tree();
        let parsed = parse_state(&tree);
        let placeholder = parsed
            .scalar_tree
            .get_path("w")
            .unwrap()
            .as_placeholder()
            .unwrap();
        assert_eq!(placeholder, "TENSOR|w");
    }

    #[test]
    fn splice_tensor_round_trips() {
        let tree = sample_tree();
        let parsed = parse_state(&tree);
        let mut restored = scalar_tree_to_restored(parsed.scalar_tree);
        let record = &parsed.tensor_records[0];
        let tensor = HostTensor::new(record.dtype, record.shape.clone(), record.bytes.to_vec());
        splice_tensor(&mut restored, "w", tensor.clone()).unwrap();
        match restored {
            RestoredValue::Map(m) => match &m["w"] {
                RestoredValue::Tensor(t) => assert_eq!(*t, tensor),
                _ => panic!("expected spliced tensor"),
            },
            _ => panic!("expected map"),
        }
    }

    #[test]
    fn splice_tensor_detects_corruption() {
        let tree = sample_tree();
        let parsed = parse_state(&tree);
        let mut restored = scalar_tree_to_restored(parsed.scalar_tree);
        // Flip the placeholder string to simulate a corrupted byte.
        if let RestoredValue::Map(m) = &mut restored {
            m.insert(
                "w".to_string(),
                RestoredValue::Scalar(ScalarValue::Str("TENSOR|w_corrupt".to_string())),
            );
        }
        let record = &parsed.tensor_records[0];
        let tensor = HostTensor::new(record.dtype, record.shape.clone(), record.bytes.to_vec());
        let err = splice_tensor(&mut restored, "w", tensor).unwrap_err();
        assert!(matches!(err, EngineError::KeyMismatch { .. }));
    }
}
