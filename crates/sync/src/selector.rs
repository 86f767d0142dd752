use serde::{Deserialize, Serialize};
use tendril_primitives::Cid;

/// Describes which edges a DAG traversal follows from a root link.
///
/// The default sequence explores every edge of every node with no depth
/// bound. An optional stop link bounds the traversal semantically: the
/// traversal does not visit the stop link's block and does not recurse past
/// it. "Is the stop link" is byte equality on the full link.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Maximum recursion depth; the root sits at depth zero. `None` is
    /// unbounded.
    pub limit: Option<u64>,

    /// Link at which traversal stops.
    pub stop: Option<Cid>,
}

impl Selector {
    /// All edges, unbounded depth.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn depth(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            stop: None,
        }
    }

    #[must_use]
    pub fn with_stop(mut self, stop: Cid) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn is_stop(&self, cid: &Cid) -> bool {
        self.stop.as_ref() == Some(cid)
    }

    /// Whether a traversal positioned at `depth` may follow edges out of
    /// the current node.
    pub fn should_recurse(&self, depth: u64) -> bool {
        match self.limit {
            Some(limit) => depth < limit,
            None => true,
        }
    }
}

/// Wraps an optional default exploration sequence with an optional stop
/// link. An absent sequence means "all edges, unbounded"; an absent stop
/// applies no stop.
pub fn explore_with_stop(dss: Option<Selector>, stop: Option<Cid>) -> Selector {
    let mut selector = dss.unwrap_or_default();
    selector.stop = stop;
    selector
}
