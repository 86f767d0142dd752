use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cid::Cid;

/// Canonical payload of a block.
///
/// A node carries the outgoing links that form the DAG plus an arbitrary
/// JSON payload. Its encoded form is the block's bytes; a block's cid is the
/// hash of those bytes. Unknown fields are rejected so that a block either
/// decodes to exactly this shape or is treated as corrupt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub links: Vec<Cid>,
    pub payload: Value,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    #[error("invalid node encoding: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Node {
    pub fn leaf(payload: Value) -> Self {
        Self {
            links: Vec::new(),
            payload,
        }
    }

    pub fn with_links(links: Vec<Cid>, payload: Value) -> Self {
        Self { links, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("node serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NodeError> {
        serde_json::from_slice(bytes).map_err(NodeError::Decode)
    }

    /// The content address of this node's encoded form.
    pub fn cid(&self) -> Cid {
        Cid::hash(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let child = Node::leaf(json!({"value": "genesis"}));
        let node = Node::with_links(vec![child.cid()], json!({"value": "head"}));

        let decoded = Node::decode(&node.encode()).unwrap();

        assert_eq!(decoded, node);
        assert_eq!(decoded.links, vec![child.cid()]);
    }

    #[test]
    fn cid_matches_encoded_bytes() {
        let node = Node::leaf(json!(42));

        assert_eq!(node.cid(), Cid::hash(&node.encode()));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Node::decode(br#"{"links": [], "payload": 1, "extra": true}"#);

        assert!(matches!(err, Err(NodeError::Decode(_))));
    }

    #[test]
    fn distinct_payloads_get_distinct_cids() {
        let a = Node::leaf(json!("a"));
        let b = Node::leaf(json!("b"));

        assert_ne!(a.cid(), b.cid());
    }
}
