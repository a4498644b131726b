//! Chain facade over a transactional key-value store.
//!
//! Blocks live in a single bucket keyed by their hash. One reserved key,
//! [`HEAD_KEY`], holds the hash of the most recently appended block. The
//! chain is walked backwards from that head to the origin block.

use crate::constants::{BLOCKS_BUCKET, HEAD_KEY, HASH_SIZE};
use crate::{Block, ChainError, Hash, Result};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Read-only view of the store inside a transaction.
pub trait ReadTx {
    fn bucket_exists(&self, bucket: &str) -> Result<bool>;
    /// `Ok(None)` when the key or the bucket is absent.
    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Number of keys in `bucket`; zero when the bucket is absent.
    fn count(&self, bucket: &str) -> Result<usize>;
}

/// Read-write view of the store inside a transaction. Mutations are staged
/// and only become visible to other transactions once the enclosing
/// [`ChainStore::write`] commits.
pub trait WriteTx: ReadTx {
    fn create_bucket_if_absent(&mut self, bucket: &str) -> Result<()>;
    /// Fails with [`ChainError::StoreIo`] if `bucket` has not been created.
    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Trait the storage backends implement for the chain to operate.
/// This lives in `ledger-core` to avoid a circular dependency.
///
/// Any number of `read` calls may run at once. At most one `write` runs at
/// a time store-wide; later writers block until it commits or rolls back.
/// If the closure passed to `write` returns `Err`, nothing it staged is
/// committed. [`ChainError::Unflushed`] is the one error `write` returns
/// after its writes became visible.
///
/// A `read` closure sees one consistent snapshot for its whole duration.
/// It must not call `write` on the same store.
pub trait ChainStore: Send + Sync {
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>;

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>;

    /// Flush everything committed so far to durable storage.
    fn close(&self) -> Result<()>;
}

fn read_head<T: ReadTx + ?Sized>(tx: &T) -> Result<Option<Hash>> {
    match tx.get(BLOCKS_BUCKET, HEAD_KEY)? {
        Some(bytes) => to_hash(&bytes).map(Some).ok_or_else(|| {
            ChainError::CorruptHead(format!(
                "expected {HASH_SIZE} bytes, found {}: {}",
                bytes.len(),
                hex::encode(&bytes)
            ))
        }),
        None => Ok(None),
    }
}

fn put_block<T: WriteTx + ?Sized>(tx: &mut T, block: &Block) -> Result<()> {
    tx.put(BLOCKS_BUCKET, &block.hash, &block.serialize()?)?;
    tx.put(BLOCKS_BUCKET, HEAD_KEY, &block.hash)
}

fn to_hash(bytes: &[u8]) -> Option<Hash> {
    if bytes.len() != HASH_SIZE {
        return None;
    }
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(bytes);
    Some(out)
}

/// Looks up and decodes the block stored under `hash`, checking that the
/// decoded block really is the one addressed by `hash`.
fn load_block<S: ChainStore>(store: &S, hash: &Hash) -> Result<Option<Block>> {
    let Some(bytes) = store.read(|tx| tx.get(BLOCKS_BUCKET, hash))? else {
        return Ok(None);
    };
    let block = Block::deserialize(&bytes).map_err(|e| {
        warn!(hash = %hex::encode(hash), error = %e, "stored block failed to decode");
        e
    })?;
    if block.hash != *hash || !block.verify_hash() {
        warn!(hash = %hex::encode(hash), "stored block does not match its hash");
        return Err(ChainError::CorruptBlock(format!(
            "block stored under {} hashes to {}",
            hex::encode(hash),
            hex::encode(Block::compute_hash(
                block.timestamp,
                &block.data,
                block.prev_block_hash.as_ref()
            ))
        )));
    }
    Ok(Some(block))
}

/// Append-only hash-linked chain with a cached head pointer.
///
/// Clones share the store handle, the cached head and the append lock.
pub struct Chain<S: ChainStore> {
    store: Arc<S>,
    tip: Arc<RwLock<Hash>>,
    // Serializes head updates across clones so the cache never moves
    // backwards. `tip` itself is only locked for the assignment.
    appending: Arc<Mutex<()>>,
}

impl<S: ChainStore> Clone for Chain<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tip: Arc::clone(&self.tip),
            appending: Arc::clone(&self.appending),
        }
    }
}

impl<S: ChainStore> Chain<S> {
    /// Load the chain from `store`, creating the blocks bucket and the
    /// genesis block if the bucket does not exist yet.
    pub fn open(store: Arc<S>) -> Result<Self> {
        let tip = store.write(|tx| {
            if tx.bucket_exists(BLOCKS_BUCKET)? {
                return read_head(&*tx)?.ok_or(ChainError::MissingHead);
            }
            let genesis = Block::genesis();
            info!(hash = %hex::encode(genesis.hash), "no existing chain found, creating genesis block");
            tx.create_bucket_if_absent(BLOCKS_BUCKET)?;
            put_block(tx, &genesis)?;
            Ok(genesis.hash)
        })?;
        debug!(tip = %hex::encode(tip), "chain opened");
        Ok(Self {
            store,
            tip: Arc::new(RwLock::new(tip)),
            appending: Arc::new(Mutex::new(())),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The cached head hash.
    pub fn tip(&self) -> Hash {
        *self.tip_read()
    }

    /// Re-read the persisted head pointer into the cache. Only needed when
    /// another handle on the same store may have appended.
    pub fn refresh(&self) -> Result<Hash> {
        let _appending = self.append_lock();
        let head = self
            .store
            .read(|tx| read_head(tx))?
            .ok_or(ChainError::MissingHead)?;
        let mut tip = self.tip_write();
        if *tip != head {
            debug!(from = %hex::encode(*tip), to = %hex::encode(head), "head refreshed");
        }
        *tip = head;
        Ok(head)
    }

    /// Append a block carrying `data` on top of the current head.
    ///
    /// The head is read and the new block plus the updated head pointer are
    /// written in one write transaction, so concurrent appends are
    /// serialized by the store and every block stays reachable from the
    /// head. On failure neither the block nor the head pointer is written.
    ///
    /// [`ChainError::Unflushed`] is the exception: the block is committed
    /// and becomes the head, the cache follows it, and the error is still
    /// returned so the caller knows durability is unconfirmed.
    pub fn append(&self, data: impl Into<Vec<u8>>) -> Result<Block> {
        let data = data.into();
        let _appending = self.append_lock();
        let mut staged = None;
        let result = self.store.write(|tx| {
            let head = read_head(&*tx)?.ok_or(ChainError::MissingHead)?;
            let block = Block::new(data, head);
            put_block(tx, &block)?;
            staged = Some(block.hash);
            Ok(block)
        });
        let block = match result {
            Ok(block) => block,
            Err(err @ ChainError::Unflushed(_)) => {
                if let Some(hash) = staged {
                    *self.tip_write() = hash;
                    warn!(hash = %hex::encode(hash), error = %err, "block appended but not flushed");
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        *self.tip_write() = block.hash;
        debug!(
            hash = %hex::encode(block.hash),
            size = block.data.len(),
            "block appended"
        );
        Ok(block)
    }

    /// Fetch a single block by hash.
    pub fn block(&self, hash: &Hash) -> Result<Option<Block>> {
        load_block(&*self.store, hash)
    }

    /// Number of blocks stored in the bucket, reachable or not.
    pub fn stored_blocks(&self) -> Result<usize> {
        let keys = self.store.read(|tx| tx.count(BLOCKS_BUCKET))?;
        Ok(keys.saturating_sub(1))
    }

    /// A fresh backward iterator starting at the cached head.
    pub fn iter(&self) -> ChainIterator<S> {
        ChainIterator {
            store: Arc::clone(&self.store),
            current: Some(self.tip()),
        }
    }

    /// Flush the store. The store handle itself is released once the last
    /// chain handle and iterator referencing it are dropped.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    fn tip_read(&self) -> RwLockReadGuard<'_, Hash> {
        self.tip.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tip_write(&self) -> RwLockWriteGuard<'_, Hash> {
        self.tip.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append_lock(&self) -> MutexGuard<'_, ()> {
        self.appending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single-pass walk from a head hash back to the origin block.
///
/// Yields `Ok(block)` per step and stops after the origin block. The first
/// error ends the walk: a corrupt or missing block is reported once and the
/// iterator is exhausted afterwards.
pub struct ChainIterator<S: ChainStore> {
    store: Arc<S>,
    current: Option<Hash>,
}

impl<S: ChainStore> ChainIterator<S> {
    /// `Ok(None)` once the origin block has been returned.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        let Some(hash) = self.current.take() else {
            return Ok(None);
        };
        let block = load_block(&*self.store, &hash)?
            .ok_or_else(|| ChainError::MissingBlock(hex::encode(hash)))?;
        self.current = block.prev_block_hash;
        Ok(Some(block))
    }

    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }
}

impl<S: ChainStore> Iterator for ChainIterator<S> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

impl<S: ChainStore> std::iter::FusedIterator for ChainIterator<S> {}
