//! Content-addressed block storage.
//!
//! Blocks are keyed by a CID derived from their bytes, so every read is
//! self-verifying: the stored bytes are rehashed and compared against the
//! requested identifier before they are returned. Files larger than one
//! chunk are stored as raw chunks plus a dag-json file node listing them.

pub mod canonical;
pub mod cid;
pub mod store;

pub use cid::{Cid, Codec};
pub use store::{BlockStore, MemoryBlockStore, SledBlockStore};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
/// Hashing above this size runs on the blocking pool.
const OFFLOAD_THRESHOLD: usize = 64 * 1024;
const FILE_NODE_TYPE: &str = "file";

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Block not found: {0}")]
    NotFound(String),
    #[error("Integrity mismatch for {0}: stored bytes do not hash to the requested CID")]
    IntegrityMismatch(String),
    #[error("Invalid CID: {0}")]
    InvalidCid(String),
    #[error("Invalid structured value: {0}")]
    InvalidStructuredValue(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// dag-json node describing a chunked file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct FileNode {
    #[serde(rename = "type")]
    kind: String,
    size: u64,
    links: Vec<Link>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct Link {
    #[serde(rename = "/")]
    cid: Cid,
}

pub struct ContentStore {
    blocks: Arc<dyn BlockStore>,
    chunk_size: usize,
}

impl ContentStore {
    pub fn new(blocks: Arc<dyn BlockStore>, chunk_size: usize) -> Self {
        Self {
            blocks,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlockStore::new()), DEFAULT_CHUNK_SIZE)
    }

    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    /// Store one block. Structured blocks are re-encoded canonically first,
    /// so equal values always get the same CID.
    pub async fn put(&self, data: impl Into<Bytes>, codec: Codec) -> Result<Cid, ContentError> {
        let data: Bytes = data.into();
        let data = match codec {
            Codec::Raw => data,
            Codec::DagJson => {
                let value: Value = serde_json::from_slice(&data)
                    .map_err(|e| ContentError::InvalidStructuredValue(e.to_string()))?;
                Bytes::from(canonical::canonicalize(&value))
            }
        };
        self.put_block(data, codec).await
    }

    async fn put_block(&self, data: Bytes, codec: Codec) -> Result<Cid, ContentError> {
        let cid = compute_cid(codec, data.clone()).await?;
        if !self.blocks.has(&cid).await? {
            self.blocks.put(&cid, data).await?;
        }
        debug!("📦 Stored block {}", cid);
        Ok(cid)
    }

    /// Fetch and verify a block.
    pub async fn get(&self, cid: &Cid) -> Result<Bytes, ContentError> {
        let data = self
            .blocks
            .get(cid)
            .await?
            .ok_or_else(|| ContentError::NotFound(cid.to_string()))?;
        if !block_matches(*cid, data.clone()).await? {
            warn!("⚠️  Block {} failed integrity check", cid);
            return Err(ContentError::IntegrityMismatch(cid.to_string()));
        }
        Ok(data)
    }

    /// Store a block received from elsewhere under its claimed CID. The bytes
    /// are kept as received and must hash to `cid`.
    pub async fn import_block(&self, cid: &Cid, data: Bytes) -> Result<(), ContentError> {
        if !block_matches(*cid, data.clone()).await? {
            return Err(ContentError::IntegrityMismatch(cid.to_string()));
        }
        if !self.blocks.has(cid).await? {
            self.blocks.put(cid, data).await?;
        }
        Ok(())
    }

    /// Child blocks a reader of `cid` also needs: the chunks of a file node,
    /// nothing for anything else.
    pub async fn links(&self, cid: &Cid) -> Result<Vec<Cid>, ContentError> {
        if cid.codec() != Codec::DagJson {
            return Ok(Vec::new());
        }
        let value = self.get_value(cid).await?;
        if value.get("type").and_then(Value::as_str) != Some(FILE_NODE_TYPE) {
            return Ok(Vec::new());
        }
        Ok(self.file_links(cid).await?.into_iter().collect())
    }

    /// dag put
    pub async fn put_value(&self, value: &Value) -> Result<Cid, ContentError> {
        let encoded = canonical::canonicalize(value);
        self.put_block(Bytes::from(encoded), Codec::DagJson).await
    }

    /// dag get
    pub async fn get_value(&self, cid: &Cid) -> Result<Value, ContentError> {
        if cid.codec() != Codec::DagJson {
            return Err(ContentError::InvalidStructuredValue(format!(
                "{} is not a dag-json block",
                cid
            )));
        }
        let data = self.get(cid).await?;
        serde_json::from_slice(&data).map_err(|e| ContentError::InvalidStructuredValue(e.to_string()))
    }

    /// Add a file. Content up to one chunk is a single raw block; larger
    /// content becomes raw chunks linked from a dag-json file node.
    pub async fn add(&self, data: impl Into<Bytes>) -> Result<Cid, ContentError> {
        let data: Bytes = data.into();
        if data.len() <= self.chunk_size {
            return self.put_block(data, Codec::Raw).await;
        }

        let mut links = Vec::with_capacity(data.len().div_ceil(self.chunk_size));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            let cid = self.put_block(data.slice(offset..end), Codec::Raw).await?;
            links.push(Link { cid });
            offset = end;
        }
        let node = FileNode {
            kind: FILE_NODE_TYPE.to_string(),
            size: data.len() as u64,
            links,
        };
        let value = serde_json::to_value(&node)
            .map_err(|e| ContentError::InvalidStructuredValue(e.to_string()))?;
        let cid = self.put_value(&value).await?;
        debug!(
            "📁 Added {} bytes as {} chunks under {}",
            data.len(),
            node.links.len(),
            cid
        );
        Ok(cid)
    }

    /// Stream a file's bytes chunk by chunk, verifying each as it is read.
    /// Every call starts from the beginning.
    pub fn cat(&self, cid: &Cid) -> impl Stream<Item = Result<Bytes, ContentError>> + Send + '_ {
        enum State {
            Root(Cid),
            Chunks(VecDeque<Cid>),
        }

        stream::try_unfold(State::Root(*cid), move |state| async move {
            let mut chunks = match state {
                State::Root(root) if root.codec() == Codec::Raw => {
                    let data = self.get(&root).await?;
                    return Ok::<_, ContentError>(Some((data, State::Chunks(VecDeque::new()))));
                }
                State::Root(root) => self.file_links(&root).await?,
                State::Chunks(chunks) => chunks,
            };
            match chunks.pop_front() {
                Some(chunk) => {
                    let data = self.get(&chunk).await?;
                    Ok(Some((data, State::Chunks(chunks))))
                }
                None => Ok(None),
            }
        })
    }

    async fn file_links(&self, cid: &Cid) -> Result<VecDeque<Cid>, ContentError> {
        let value = self.get_value(cid).await?;
        let node: FileNode = serde_json::from_value(value)
            .map_err(|e| ContentError::InvalidStructuredValue(format!("not a file node: {}", e)))?;
        if node.kind != FILE_NODE_TYPE {
            return Err(ContentError::InvalidStructuredValue(format!(
                "unexpected node type {:?}",
                node.kind
            )));
        }
        if let Some(link) = node.links.iter().find(|l| l.cid.codec() != Codec::Raw) {
            return Err(ContentError::InvalidStructuredValue(format!(
                "file link {} is not a raw block",
                link.cid
            )));
        }
        Ok(node.links.into_iter().map(|l| l.cid).collect())
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool, ContentError> {
        self.blocks.has(cid).await
    }

    pub async fn remove(&self, cid: &Cid) -> Result<bool, ContentError> {
        self.blocks.remove(cid).await
    }
}

async fn compute_cid(codec: Codec, data: Bytes) -> Result<Cid, ContentError> {
    if data.len() <= OFFLOAD_THRESHOLD {
        return Ok(Cid::compute(codec, &data));
    }
    tokio::task::spawn_blocking(move || Cid::compute(codec, &data))
        .await
        .map_err(|e| ContentError::Storage(format!("hashing task failed: {}", e)))
}

async fn block_matches(cid: Cid, data: Bytes) -> Result<bool, ContentError> {
    if data.len() <= OFFLOAD_THRESHOLD {
        return Ok(cid.matches(&data));
    }
    tokio::task::spawn_blocking(move || cid.matches(&data))
        .await
        .map_err(|e| ContentError::Storage(format!("hashing task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = ContentStore::in_memory();
        let a = store.put(&b"same bytes"[..], Codec::Raw).await.unwrap();
        let b = store.put(&b"same bytes"[..], Codec::Raw).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.block_store().len().await.unwrap(), 1);
        assert_eq!(store.get(&a).await.unwrap(), &b"same bytes"[..]);
    }

    #[tokio::test]
    async fn test_structured_round_trip() {
        let store = ContentStore::in_memory();
        let value = json!({"content": "x"});
        let cid = store.put_value(&value).await.unwrap();
        assert_eq!(cid.codec(), Codec::DagJson);
        assert_eq!(store.get_value(&cid).await.unwrap(), value);

        // Same value, different formatting: same CID.
        let spaced = store
            .put(&b"{ \"content\" : \"x\" }"[..], Codec::DagJson)
            .await
            .unwrap();
        assert_eq!(spaced, cid);
    }

    #[tokio::test]
    async fn test_invalid_structured_rejected() {
        let store = ContentStore::in_memory();
        assert!(matches!(
            store.put(&b"{not json"[..], Codec::DagJson).await,
            Err(ContentError::InvalidStructuredValue(_))
        ));
        let raw = store.put(&b"raw"[..], Codec::Raw).await.unwrap();
        assert!(matches!(
            store.get_value(&raw).await,
            Err(ContentError::InvalidStructuredValue(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_block() {
        let store = ContentStore::in_memory();
        let cid = Cid::compute(Codec::Raw, b"never stored");
        assert!(matches!(
            store.get(&cid).await,
            Err(ContentError::NotFound(_))
        ));
        assert!(!store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_block_detected() {
        let blocks: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let store = ContentStore::new(blocks.clone(), DEFAULT_CHUNK_SIZE);
        let cid = store.put(&b"original"[..], Codec::Raw).await.unwrap();
        blocks
            .put(&cid, Bytes::from_static(b"tampered"))
            .await
            .unwrap();
        assert!(matches!(
            store.get(&cid).await,
            Err(ContentError::IntegrityMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_small_file_is_single_block() {
        let store = ContentStore::in_memory();
        let cid = store.add(&b"peer ipfs file #1"[..]).await.unwrap();
        assert_eq!(cid.codec(), Codec::Raw);
        let chunks: Vec<Bytes> = store.cat(&cid).try_collect().await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"peer ipfs file #1")]);
    }

    #[tokio::test]
    async fn test_chunked_add_and_cat() {
        let store = ContentStore::new(Arc::new(MemoryBlockStore::new()), 1024);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let cid = store.add(data.clone()).await.unwrap();
        assert_eq!(cid.codec(), Codec::DagJson);

        let node = store.get_value(&cid).await.unwrap();
        assert_eq!(node["type"], "file");
        assert_eq!(node["size"], 5000);
        assert_eq!(node["links"].as_array().unwrap().len(), 5);

        let chunks: Vec<Bytes> = store.cat(&cid).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.concat(), data);

        // Restartable: a second read yields the same bytes.
        let again: Vec<Bytes> = store.cat(&cid).try_collect().await.unwrap();
        assert_eq!(again.concat(), data);
    }

    #[tokio::test]
    async fn test_cat_fails_on_tampered_chunk() {
        let blocks: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let store = ContentStore::new(blocks.clone(), 4);
        let cid = store.add(&b"abcdefgh"[..]).await.unwrap();
        let second = Cid::compute(Codec::Raw, b"efgh");
        blocks.put(&second, Bytes::from_static(b"EFGH")).await.unwrap();

        let mut stream = Box::pin(store.cat(&cid));
        assert_eq!(
            stream.try_next().await.unwrap().unwrap(),
            &b"abcd"[..]
        );
        assert!(matches!(
            stream.try_next().await,
            Err(ContentError::IntegrityMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_large_block_hashed_off_thread() {
        let store = ContentStore::new(Arc::new(MemoryBlockStore::new()), 1024 * 1024);
        let data = vec![7u8; OFFLOAD_THRESHOLD * 2];
        let cid = store.add(data.clone()).await.unwrap();
        assert_eq!(cid, Cid::compute(Codec::Raw, &data));
        assert_eq!(store.get(&cid).await.unwrap().len(), data.len());
    }

    #[tokio::test]
    async fn test_import_block_checks_hash() {
        let store = ContentStore::in_memory();
        let cid = Cid::compute(Codec::Raw, b"remote");
        assert!(matches!(
            store.import_block(&cid, Bytes::from_static(b"forged")).await,
            Err(ContentError::IntegrityMismatch(_))
        ));
        assert!(!store.has(&cid).await.unwrap());
        store
            .import_block(&cid, Bytes::from_static(b"remote"))
            .await
            .unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), &b"remote"[..]);
    }

    #[tokio::test]
    async fn test_links() {
        let store = ContentStore::new(Arc::new(MemoryBlockStore::new()), 4);
        let file = store.add(&b"abcdefgh"[..]).await.unwrap();
        assert_eq!(
            store.links(&file).await.unwrap(),
            vec![Cid::compute(Codec::Raw, b"abcd"), Cid::compute(Codec::Raw, b"efgh")]
        );
        let value = store.put_value(&json!({"content": "x"})).await.unwrap();
        assert!(store.links(&value).await.unwrap().is_empty());
        let raw = store.put(&b"ab"[..], Codec::Raw).await.unwrap();
        assert!(store.links(&raw).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = ContentStore::in_memory();
        let cid = store.put(&b"gone"[..], Codec::Raw).await.unwrap();
        assert!(store.remove(&cid).await.unwrap());
        assert!(matches!(
            store.get(&cid).await,
            Err(ContentError::NotFound(_))
        ));
    }
}
