use super::{Cid, ContentError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Raw block persistence. Integrity checking happens above this layer.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, ContentError>;
    async fn put(&self, cid: &Cid, data: Bytes) -> Result<(), ContentError>;
    async fn has(&self, cid: &Cid) -> Result<bool, ContentError>;
    async fn remove(&self, cid: &Cid) -> Result<bool, ContentError>;
    async fn len(&self) -> Result<usize, ContentError>;
}

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<HashMap<Cid, Bytes>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, ContentError> {
        Ok(self.blocks.read().await.get(cid).cloned())
    }

    async fn put(&self, cid: &Cid, data: Bytes) -> Result<(), ContentError> {
        self.blocks.write().await.insert(*cid, data);
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, ContentError> {
        Ok(self.blocks.read().await.contains_key(cid))
    }

    async fn remove(&self, cid: &Cid) -> Result<bool, ContentError> {
        Ok(self.blocks.write().await.remove(cid).is_some())
    }

    async fn len(&self) -> Result<usize, ContentError> {
        Ok(self.blocks.read().await.len())
    }
}

pub struct SledBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
}

impl SledBlockStore {
    pub fn open(path: &str) -> Result<Self, ContentError> {
        let db = sled::open(path)
            .map_err(|e| ContentError::Storage(format!("failed to open {}: {}", path, e)))?;
        let blocks = db.open_tree("blocks").map_err(storage_err)?;
        Ok(Self { db, blocks })
    }

    pub fn flush(&self) -> Result<(), ContentError> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: sled::Error) -> ContentError {
    ContentError::Storage(e.to_string())
}

#[async_trait::async_trait]
impl BlockStore for SledBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>, ContentError> {
        let value = self.blocks.get(cid.to_bytes()).map_err(storage_err)?;
        Ok(value.map(|v| Bytes::copy_from_slice(&v)))
    }

    async fn put(&self, cid: &Cid, data: Bytes) -> Result<(), ContentError> {
        self.blocks
            .insert(cid.to_bytes(), data.as_ref())
            .map_err(storage_err)?;
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool, ContentError> {
        self.blocks.contains_key(cid.to_bytes()).map_err(storage_err)
    }

    async fn remove(&self, cid: &Cid) -> Result<bool, ContentError> {
        Ok(self
            .blocks
            .remove(cid.to_bytes())
            .map_err(storage_err)?
            .is_some())
    }

    async fn len(&self) -> Result<usize, ContentError> {
        Ok(self.blocks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Codec;

    async fn exercise(store: &dyn BlockStore) {
        let cid = Cid::compute(Codec::Raw, b"block");
        assert!(store.get(&cid).await.unwrap().is_none());
        store.put(&cid, Bytes::from_static(b"block")).await.unwrap();
        store.put(&cid, Bytes::from_static(b"block")).await.unwrap();
        assert!(store.has(&cid).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get(&cid).await.unwrap().unwrap(), &b"block"[..]);
        assert!(store.remove(&cid).await.unwrap());
        assert!(!store.remove(&cid).await.unwrap());
        assert!(!store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryBlockStore::new()).await;
    }

    #[tokio::test]
    async fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let store = SledBlockStore::open(path.to_str().unwrap()).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sled_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");
        let path = path.to_str().unwrap();
        let cid = Cid::compute(Codec::Raw, b"persist");
        {
            let store = SledBlockStore::open(path).unwrap();
            store.put(&cid, Bytes::from_static(b"persist")).await.unwrap();
            store.flush().unwrap();
        }
        let store = SledBlockStore::open(path).unwrap();
        assert_eq!(store.get(&cid).await.unwrap().unwrap(), &b"persist"[..]);
    }
}
