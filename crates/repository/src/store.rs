//! The local shard storage collaborator.
//!
//! The engine reads snapshot input from and restores into a [`ShardStore`]:
//! the node-local storage of one shard, pinned to a specific commit. Reads
//! and writes go through reference counting so a store that closes mid-
//! operation fails the operation instead of the process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{RepositoryError, Result};
use crate::shard::StoreFileMetadata;

/// The file listing of a pinned commit.
#[derive(Debug, Clone)]
pub struct ShardCommit {
    pub files: Vec<StoreFileMetadata>,
    /// Identity of the commit; equal identifiers mean an identical file set.
    pub state_identifier: Option<String>,
}

/// Node-local storage of one shard, pinned to a commit.
#[async_trait]
pub trait ShardStore: Send + Sync + std::fmt::Debug {
    /// Take a reference on the store. Returns false when the store has been
    /// closed; the caller must then abort.
    fn try_incref(&self) -> bool;

    /// Release a reference taken with `try_incref`.
    fn decref(&self);

    /// The pinned commit's file listing with content hashes.
    async fn commit(&self) -> Result<ShardCommit>;

    /// Read `length` bytes of the named physical file starting at `offset`.
    async fn read_chunk(&self, name: &str, offset: u64, length: u64) -> Result<Bytes>;

    /// Open a verified output for restoring one file. The returned output
    /// checks content integrity when finished.
    async fn open_output(&self, metadata: &StoreFileMetadata) -> Result<Box<dyn VerifiedOutput>>;

    /// Record that this store's on-disk state failed an integrity check.
    fn mark_corrupted(&self, reason: &str);
}

/// Verifying sink for one restored file.
#[async_trait]
pub trait VerifiedOutput: Send {
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Complete the file, verifying content against the expected metadata.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Scoped store reference: released on drop on every exit path.
#[derive(Debug)]
pub struct StoreRef<'a> {
    store: &'a dyn ShardStore,
}

impl<'a> StoreRef<'a> {
    /// Acquire a reference, failing with [`RepositoryError::StoreClosed`]
    /// when the store is gone.
    pub fn acquire(store: &'a dyn ShardStore) -> Result<Self> {
        if store.try_incref() {
            Ok(Self { store })
        } else {
            Err(RepositoryError::StoreClosed)
        }
    }
}

impl Drop for StoreRef<'_> {
    fn drop(&mut self) {
        self.store.decref();
    }
}

/// Compute the content checksum the way the store records it.
pub fn content_checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// In-memory shard store for tests and single-node embedding. Cloneable
/// handle; clones share the same files and reference count.
#[derive(Debug, Default, Clone)]
pub struct MemoryShardStore {
    shared: Arc<MemoryShardStoreShared>,
}

#[derive(Debug, Default)]
struct MemoryShardStoreShared {
    inner: RwLock<MemoryShardStoreInner>,
    refs: AtomicI64,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryShardStoreInner {
    files: BTreeMap<String, (StoreFileMetadata, Bytes)>,
    state_identifier: Option<String>,
    corrupted: Option<String>,
}

impl MemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the pinned commit. `inline` marks files small enough
    /// that their bytes double as their hash.
    pub fn add_file(&self, name: &str, content: Bytes, inline: bool) {
        let metadata = StoreFileMetadata::new(
            name,
            content.len() as u64,
            content_checksum(&content),
            Some("9.7.0".to_string()),
            inline.then(|| content.clone()),
        );
        self.shared
            .inner
            .write()
            .expect("store lock poisoned")
            .files
            .insert(name.to_string(), (metadata, content));
    }

    pub fn remove_file(&self, name: &str) {
        self.shared
            .inner
            .write()
            .expect("store lock poisoned")
            .files
            .remove(name);
    }

    pub fn set_state_identifier(&self, identifier: Option<String>) {
        self.shared
            .inner
            .write()
            .expect("store lock poisoned")
            .state_identifier = identifier;
    }

    /// Stop handing out references; in-flight guards stay valid.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> i64 {
        self.shared.refs.load(Ordering::SeqCst)
    }

    pub fn corruption(&self) -> Option<String> {
        self.shared
            .inner
            .read()
            .expect("store lock poisoned")
            .corrupted
            .clone()
    }

    /// Content of a file, restored or original.
    pub fn file_content(&self, name: &str) -> Option<Bytes> {
        self.shared
            .inner
            .read()
            .expect("store lock poisoned")
            .files
            .get(name)
            .map(|(_, content)| content.clone())
    }

    pub fn file_names(&self) -> Vec<String> {
        self.shared
            .inner
            .read()
            .expect("store lock poisoned")
            .files
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    fn try_incref(&self) -> bool {
        if self.shared.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.refs.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn decref(&self) {
        self.shared.refs.fetch_sub(1, Ordering::SeqCst);
    }

    async fn commit(&self) -> Result<ShardCommit> {
        let inner = self.shared.inner.read().expect("store lock poisoned");
        if let Some(reason) = &inner.corrupted {
            return Err(RepositoryError::CorruptBlob {
                name: "store".to_string(),
                reason: reason.clone(),
            });
        }
        Ok(ShardCommit {
            files: inner.files.values().map(|(meta, _)| meta.clone()).collect(),
            state_identifier: inner.state_identifier.clone(),
        })
    }

    async fn read_chunk(&self, name: &str, offset: u64, length: u64) -> Result<Bytes> {
        let inner = self.shared.inner.read().expect("store lock poisoned");
        let (_, content) = inner.files.get(name).ok_or_else(|| {
            RepositoryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {name}"),
            ))
        })?;
        let start = offset.min(content.len() as u64) as usize;
        let end = (offset + length).min(content.len() as u64) as usize;
        Ok(content.slice(start..end))
    }

    async fn open_output(&self, metadata: &StoreFileMetadata) -> Result<Box<dyn VerifiedOutput>> {
        Ok(Box::new(MemoryVerifiedOutput {
            store: self.clone(),
            metadata: metadata.clone(),
            buffer: Vec::with_capacity(metadata.length() as usize),
        }))
    }

    fn mark_corrupted(&self, reason: &str) {
        self.shared
            .inner
            .write()
            .expect("store lock poisoned")
            .corrupted
            .get_or_insert_with(|| reason.to_string());
    }
}

struct MemoryVerifiedOutput {
    store: MemoryShardStore,
    metadata: StoreFileMetadata,
    buffer: Vec<u8>,
}

#[async_trait]
impl VerifiedOutput for MemoryVerifiedOutput {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let actual = content_checksum(&self.buffer);
        if self.buffer.len() as u64 != self.metadata.length()
            || actual != self.metadata.checksum()
        {
            let reason = format!(
                "restored file [{}] failed verification: length {}/{}, checksum {}/{}",
                self.metadata.name(),
                self.buffer.len(),
                self.metadata.length(),
                actual,
                self.metadata.checksum(),
            );
            self.store.mark_corrupted(&reason);
            return Err(RepositoryError::CorruptBlob {
                name: self.metadata.name().to_string(),
                reason,
            });
        }
        let content = Bytes::from(self.buffer);
        self.store
            .shared
            .inner
            .write()
            .expect("store lock poisoned")
            .files
            .insert(
                self.metadata.name().to_string(),
                (self.metadata.clone(), content),
            );
        Ok(())
    }
}
