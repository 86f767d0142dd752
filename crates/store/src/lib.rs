//! Content-addressed link stores.
//!
//! The [`LinkStore`] trait is the engine's only view of block persistence:
//! load a block by link, store a block under its link, check presence. The
//! store owns byte integrity (the hash is verified on both directions) but
//! none of the traversal logic. Duplicate writes of the same link are
//! idempotent.

use async_trait::async_trait;
use tendril_primitives::Cid;
use thiserror::Error;

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The bytes handed to `put` do not hash to the given link.
    #[error("block does not match link {cid}: hashed to {actual}")]
    HashMismatch { cid: Cid, actual: Cid },

    /// A stored block no longer hashes to its link.
    #[error("corrupt block for link {cid}")]
    Corrupt { cid: Cid },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Thin contract over the content-addressed store.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Loads the block for `cid`, verifying its bytes still hash to `cid`.
    async fn load(&self, cid: &Cid) -> Result<Option<Box<[u8]>>, StoreError>;

    /// Stores `bytes` under `cid`. A second store of the same link is a
    /// no-op.
    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<(), StoreError>;

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError>;
}

fn verify(cid: &Cid, bytes: &[u8]) -> Result<(), StoreError> {
    let actual = Cid::hash(bytes);
    if actual != *cid {
        return Err(StoreError::HashMismatch { cid: *cid, actual });
    }

    Ok(())
}
