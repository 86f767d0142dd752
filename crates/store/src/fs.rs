use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tendril_primitives::Cid;
use tokio::fs;

use crate::{verify, LinkStore, StoreError};

/// Filesystem link store: one file per block under a root directory, named
/// by the link's base58 form.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: Utf8PathBuf,
}

impl FsStore {
    pub async fn new(root: &Utf8Path) -> eyre::Result<Self> {
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root: root.to_owned(),
        })
    }

    fn path(&self, cid: &Cid) -> Utf8PathBuf {
        self.root.join(cid.to_string())
    }
}

#[async_trait]
impl LinkStore for FsStore {
    async fn load(&self, cid: &Cid) -> Result<Option<Box<[u8]>>, StoreError> {
        let bytes = match fs::read(self.path(cid)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        verify(cid, &bytes).map_err(|_| StoreError::Corrupt { cid: *cid })?;

        Ok(Some(bytes.into_boxed_slice()))
    }

    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<(), StoreError> {
        verify(cid, bytes)?;

        let path = self.path(cid);
        if fs::try_exists(&path).await? {
            return Ok(());
        }

        fs::write(&path, bytes).await.map_err(Into::into)
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StoreError> {
        fs::try_exists(self.path(cid)).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tendril_primitives::Node;

    use super::*;

    async fn temp_store(tag: &str) -> FsStore {
        let dir = std::env::temp_dir().join(format!("tendril-fs-{tag}-{}", std::process::id()));
        let dir = Utf8PathBuf::from_path_buf(dir).expect("temp dir is utf-8");
        FsStore::new(&dir).await.unwrap()
    }

    #[tokio::test]
    async fn put_load_round_trips() {
        let store = temp_store("round-trip").await;
        let bytes = Node::leaf(json!("on disk")).encode();
        let cid = Cid::hash(&bytes);

        store.put(&cid, &bytes).await.unwrap();

        assert!(store.has(&cid).await.unwrap());
        assert_eq!(store.load(&cid).await.unwrap().unwrap().as_ref(), &bytes[..]);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let store = temp_store("corrupt").await;
        let bytes = Node::leaf(json!("pristine")).encode();
        let cid = Cid::hash(&bytes);

        store.put(&cid, &bytes).await.unwrap();
        fs::write(store.path(&cid), b"tampered").await.unwrap();

        let err = store.load(&cid).await.unwrap_err();

        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn missing_block_loads_none() {
        let store = temp_store("missing").await;

        assert!(store.load(&Cid::hash(b"nope")).await.unwrap().is_none());
    }
}
