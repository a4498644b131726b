pub mod chain;
pub mod constants;
pub mod error;
pub mod memory;

use bincode::Options;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use chain::{Chain, ChainIterator, ChainStore, ReadTx, WriteTx};
pub use error::{ChainError, Result};
pub use memory::MemStore;

pub type Hash = [u8; 32];

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the Unix epoch, strictly increasing within the process.
fn next_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// An immutable, content-addressed ledger entry.
///
/// `prev_block_hash` is `None` only for the origin block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub timestamp: u64,
    pub data: Vec<u8>,
    pub prev_block_hash: Option<Hash>,
    pub hash: Hash,
}

impl Block {
    /// Builds a block on top of `prev_block_hash`, stamped with the current time.
    pub fn new(data: impl Into<Vec<u8>>, prev_block_hash: Hash) -> Self {
        Self::from_parts(next_timestamp(), data, Some(prev_block_hash))
    }

    /// The origin block: fixed payload, no predecessor.
    pub fn genesis() -> Self {
        Self::from_parts(next_timestamp(), constants::GENESIS_DATA, None)
    }

    pub fn from_parts(
        timestamp: u64,
        data: impl Into<Vec<u8>>,
        prev_block_hash: Option<Hash>,
    ) -> Self {
        let data = data.into();
        let hash = Self::compute_hash(timestamp, &data, prev_block_hash.as_ref());
        Self {
            timestamp,
            data,
            prev_block_hash,
            hash,
        }
    }

    pub fn hash_bytes(timestamp: u64, data: &[u8], prev_block_hash: Option<&Hash>) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 1 + 32 + 8 + data.len());
        bytes.extend_from_slice(&timestamp.to_le_bytes());
        match prev_block_hash {
            Some(prev) => {
                bytes.push(1);
                bytes.extend_from_slice(prev);
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&(data.len() as u64).to_le_bytes());
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn compute_hash(timestamp: u64, data: &[u8], prev_block_hash: Option<&Hash>) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(Self::hash_bytes(timestamp, data, prev_block_hash));
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..]);
        out
    }

    /// True when the stored hash matches the block's contents.
    pub fn verify_hash(&self) -> bool {
        self.hash == Self::compute_hash(self.timestamp, &self.data, self.prev_block_hash.as_ref())
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_none()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| ChainError::Encode(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        codec()
            .deserialize(bytes)
            .map_err(|e| ChainError::CorruptBlock(e.to_string()))
    }
}
