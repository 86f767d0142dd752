//! Subscriber-side synchronization engine for content-addressed Merkle
//! DAGs.
//!
//! Publishers announce the root link of a DAG over a pub/sub transport;
//! this engine detects the announcement, fetches the subgraph reachable
//! from that root (stopping at the last fully-synced head), persists every
//! block in a local [`LinkStore`](tendril_store::LinkStore), and notifies
//! observers once per finished sync.
//!
//! Data flow: announcement → [`Broker`] → per-publisher handler → transfer
//! session → link store. Event fan-out runs the other way.
//!
//! The wire-level exchange that actually moves blocks is a collaborator
//! behind the [`GraphExchange`] seam; alternate transports (such as HTTP)
//! plug in behind [`Transport`] and inherit the same per-publisher
//! serialization and latest-sync semantics.

pub mod announce;
pub mod broker;
pub mod config;
pub mod error;
pub mod gate;
pub mod selector;
pub mod transfer;

mod handler;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use announce::Announcement;
pub use broker::{Broker, BrokerOptions, SyncFinished, SyncFinishedSubscription};
pub use config::{Config, RateLimitConfig};
pub use error::SyncError;
pub use gate::{LimiterFor, PeerLimiter, RateGate};
pub use selector::{explore_with_stop, Selector};
pub use transfer::{
    BlockHook, BlockIngest, BlockRejected, BlockSink, GraphExchange, Syncer, Transfer,
    TransferEvent, TransferRequest, Transport,
};
