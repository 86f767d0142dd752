use tendril_store::StoreError;
use thiserror::Error;

/// Terminal outcome of a sync operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The peer is unreachable, refused, or the transfer protocol aborted.
    #[error("transfer failed: {0}")]
    Transport(String),

    /// The peer does not have a block reachable under the selector.
    #[error("transfer failed: {0}: content not found")]
    NotFound(String),

    /// The rate-limit gate refused a block; recovered by retrying inside
    /// the per-publisher handler, never surfaced to observers.
    #[error("hit rate limit")]
    RateLimited,

    #[error("sync cancelled")]
    Cancelled,

    /// The broker or transfer layer was shut down.
    #[error("sync closed")]
    Closed,

    #[error("failed to fetch head: {0}")]
    Head(String),

    /// The publisher has not announced a root yet.
    #[error("publisher has no head")]
    NoHead,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_annotated() {
        let err = SyncError::NotFound("block bafyA".to_owned());

        assert!(err.to_string().ends_with("content not found"));
    }
}
