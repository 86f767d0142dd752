//! Shared primitives for the tendril DAG replication engine.
//!
//! A [`Cid`](cid::Cid) content-addresses a block; a [`Node`](node::Node) is
//! the canonical payload of a block, carrying the outgoing links that form
//! the DAG.

pub mod cid;
pub mod node;

pub use cid::Cid;
pub use node::Node;
