//! HTTP variant of the DAG fetch protocol.
//!
//! A publisher serves its head and blocks over two GET endpoints; the
//! subscriber side is an [`HttpTransport`] satisfying the same
//! [`Transport`](tendril_sync::Transport) contract the broker drives, so
//! both transports share per-publisher serialization and the latest-sync
//! rules.

mod publish;
mod subscribe;

pub use publish::HttpPublisher;
pub use subscribe::HttpTransport;
