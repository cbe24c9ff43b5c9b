//! Generic binary-safe encoder for the scalar tree. Round-trips all five
//! value variants via MessagePack.

use crate::error::{EngineError, Result};
use crate::value::ScalarTree;

pub fn encode(tree: &ScalarTree) -> Result<Vec<u8>> {
    rmp_serde::to_vec(tree).map_err(|e| EngineError::SerializeFailed(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<ScalarTree> {
    rmp_serde::from_slice(bytes).map_err(|e| EngineError::SerializeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarValue;
    use indexmap::IndexMap;

    #[test]
    fn round_trips_nested_tree() {
        let mut map = IndexMap::new();
        map.insert("epoch".to_string(), ScalarTree::Scalar(ScalarValue::Int(7)));
        map.insert(
            "lrs".to_string(),
            ScalarTree::Seq(vec![
                ScalarTree::Scalar(ScalarValue::Float(0.1)),
                ScalarTree::Scalar(ScalarValue::Float(0.01)),
            ]),
        );
        map.insert(
            "tag".to_string(),
            ScalarTree::Scalar(ScalarValue::Str("v1".into())),
        );
        map.insert("nothing".to_string(), ScalarTree::Scalar(ScalarValue::Null));
        let tree = ScalarTree::Map(map);

        let encoded = encode(&tree).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(tree, decoded);
    }
}
