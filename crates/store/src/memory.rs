use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tendril_primitives::Cid;

use crate::{verify, LinkStore, StoreError};

/// In-memory link store, primarily for tests and embedders without a
/// persistence requirement.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<Cid, Box<[u8]>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LinkStore for MemoryStore {
    async fn load(&self, cid: &Cid) -> Result<Option<Box<[u8]>>, StoreError> {
        let blocks = self.blocks.read().expect("lock poisoned");

        let Some(bytes) = blocks.get(cid) else {
            return Ok(None);
        };

        verify(cid, bytes).map_err(|_| StoreError::Corrupt { cid: *cid })?;

        Ok(Some(bytes.clone()))
    }

    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<(), StoreError> {
        verify(cid, bytes)?;

        let mut blocks = self.blocks.write().expect("lock poisoned");
        let _ignored = blocks.entry(*cid).or_insert_with(|| bytes.into());

        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        Ok(self.blocks.read().expect("lock poisoned").contains_key(cid))
    }
}
