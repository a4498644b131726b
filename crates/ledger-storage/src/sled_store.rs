//! Durable [`ChainStore`] on top of sled.
//!
//! Each bucket is a sled tree. The names of created buckets are recorded in
//! sled's default tree, inside the same multi-tree transaction that writes
//! the bucket's first keys, so a bucket and its contents appear together or
//! not at all.
//!
//! sled reads outside a transaction see live state, so a reader could
//! observe half of a multi-tree commit. A store-wide snapshot lock closes
//! that gap: read closures hold it shared, and a commit holds it exclusively
//! only while the sled transaction applies.

use ledger_core::{ChainError, ChainStore, ReadTx, Result, WriteTx};
use sled::transaction::{TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

const BUCKET_PREFIX: &[u8] = b"bucket/";

fn registry_key(bucket: &str) -> Vec<u8> {
  let mut key = BUCKET_PREFIX.to_vec();
  key.extend_from_slice(bucket.as_bytes());
  key
}

fn bucket_exists(db: &Db, bucket: &str) -> Result<bool> {
  db.contains_key(registry_key(bucket)).map_err(ChainError::io)
}

/// The tree backing `bucket`, or `None` if the bucket was never created.
/// Never creates a tree as a side effect.
fn bucket_tree(db: &Db, bucket: &str) -> Result<Option<Tree>> {
  if !bucket_exists(db, bucket)? {
    return Ok(None);
  }
  db.open_tree(bucket).map(Some).map_err(ChainError::io)
}

#[derive(Clone)]
pub struct SledStore {
  db: Db,
  writer: Arc<Mutex<()>>,
  snapshot: Arc<RwLock<()>>,
}

impl SledStore {
  /// Open or create a store at `path`. Fails with [`ChainError::StoreOpen`]
  /// if the path is unusable or already locked by another process.
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let db = sled::open(path).map_err(|e| ChainError::StoreOpen {
      path: path.display().to_string(),
      reason: e.to_string(),
    })?;
    info!(path = %path.display(), "sled store opened");
    Ok(Self::from_db(db))
  }

  /// A store that lives in a temporary location and is removed on drop.
  pub fn open_temporary() -> Result<Self> {
    let db = sled::Config::new()
      .temporary(true)
      .open()
      .map_err(|e| ChainError::StoreOpen {
        path: "<temporary>".to_string(),
        reason: e.to_string(),
      })?;
    Ok(Self::from_db(db))
  }

  fn from_db(db: Db) -> Self {
    Self {
      db,
      writer: Arc::new(Mutex::new(())),
      snapshot: Arc::new(RwLock::new(())),
    }
  }

  pub fn create_bucket_if_absent(&self, bucket: &str) -> Result<()> {
    self.write(|tx| tx.create_bucket_if_absent(bucket))
  }

  pub fn bucket_names(&self) -> Result<Vec<String>> {
    let _shared = self
      .snapshot
      .read()
      .map_err(|_| ChainError::io("sled store snapshot lock poisoned"))?;
    self
      .db
      .scan_prefix(BUCKET_PREFIX)
      .map(|entry| {
        let (key, _) = entry.map_err(ChainError::io)?;
        Ok(String::from_utf8_lossy(&key[BUCKET_PREFIX.len()..]).into_owned())
      })
      .collect()
  }
}

struct SledReadTx<'a> {
  db: &'a Db,
}

impl ReadTx for SledReadTx<'_> {
  fn bucket_exists(&self, bucket: &str) -> Result<bool> {
    bucket_exists(self.db, bucket)
  }

  fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let Some(tree) = bucket_tree(self.db, bucket)? else {
      return Ok(None);
    };
    let value = tree.get(key).map_err(ChainError::io)?;
    Ok(value.map(|v| v.to_vec()))
  }

  fn count(&self, bucket: &str) -> Result<usize> {
    Ok(bucket_tree(self.db, bucket)?.map_or(0, |tree| tree.len()))
  }
}

struct SledWriteTx<'a> {
  db: &'a Db,
  snapshot: &'a RwLock<()>,
  created: BTreeSet<String>,
  staged: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl SledWriteTx<'_> {
  fn committed(&self) -> SledReadTx<'_> {
    SledReadTx { db: self.db }
  }

  /// Apply every staged write, plus registry entries for new buckets, in a
  /// single sled transaction, then flush. A flush failure is reported as
  /// [`ChainError::Unflushed`]: by then the writes are already visible.
  fn commit(self) -> Result<()> {
    if self.staged.is_empty() {
      return Ok(());
    }
    let mut trees: Vec<Tree> = vec![(**self.db).clone()];
    for name in self.staged.keys() {
      trees.push(self.db.open_tree(name).map_err(ChainError::io)?);
    }

    let created = &self.created;
    let staged = &self.staged;
    let exclusive = self
      .snapshot
      .write()
      .map_err(|_| ChainError::io("sled store snapshot lock poisoned"))?;
    let result: TransactionResult<(), ChainError> = trees.as_slice().transaction(|views| {
      let Some((registry, buckets)) = views.split_first() else {
        return Ok(());
      };
      for name in created {
        registry.insert(registry_key(name), name.as_bytes())?;
      }
      for (view, writes) in buckets.iter().zip(staged.values()) {
        for (key, value) in writes {
          view.insert(key.as_slice(), value.as_slice())?;
        }
      }
      Ok(())
    });
    drop(exclusive);
    match result {
      Ok(()) => {}
      Err(TransactionError::Abort(e)) => return Err(e),
      Err(TransactionError::Storage(e)) => return Err(ChainError::io(e)),
    }

    self
      .db
      .flush()
      .map_err(|e| ChainError::Unflushed(e.to_string()))?;
    debug!(
      buckets = staged.len(),
      keys = staged.values().map(|w| w.len()).sum::<usize>(),
      "write transaction committed"
    );
    Ok(())
  }
}

impl ReadTx for SledWriteTx<'_> {
  fn bucket_exists(&self, bucket: &str) -> Result<bool> {
    if self.created.contains(bucket) {
      return Ok(true);
    }
    self.committed().bucket_exists(bucket)
  }

  fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if let Some(value) = self.staged.get(bucket).and_then(|w| w.get(key)) {
      return Ok(Some(value.clone()));
    }
    self.committed().get(bucket, key)
  }

  fn count(&self, bucket: &str) -> Result<usize> {
    let Some(writes) = self.staged.get(bucket) else {
      return self.committed().count(bucket);
    };
    let Some(tree) = bucket_tree(self.db, bucket)? else {
      return Ok(writes.len());
    };
    let mut fresh = 0;
    for key in writes.keys() {
      if !tree.contains_key(key).map_err(ChainError::io)? {
        fresh += 1;
      }
    }
    Ok(tree.len() + fresh)
  }
}

impl WriteTx for SledWriteTx<'_> {
  fn create_bucket_if_absent(&mut self, bucket: &str) -> Result<()> {
    if self.bucket_exists(bucket)? {
      return Ok(());
    }
    self.created.insert(bucket.to_string());
    self.staged.entry(bucket.to_string()).or_default();
    Ok(())
  }

  fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
    if !self.bucket_exists(bucket)? {
      return Err(ChainError::io(format!("bucket {bucket} does not exist")));
    }
    self
      .staged
      .entry(bucket.to_string())
      .or_default()
      .insert(key.to_vec(), value.to_vec());
    Ok(())
  }
}

impl ChainStore for SledStore {
  fn read<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&dyn ReadTx) -> Result<T>,
  {
    let _shared = self
      .snapshot
      .read()
      .map_err(|_| ChainError::io("sled store snapshot lock poisoned"))?;
    f(&SledReadTx { db: &self.db })
  }

  fn write<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut dyn WriteTx) -> Result<T>,
  {
    let _writer = self
      .writer
      .lock()
      .map_err(|_| ChainError::io("sled store writer lock poisoned"))?;
    let mut tx = SledWriteTx {
      db: &self.db,
      snapshot: &self.snapshot,
      created: BTreeSet::new(),
      staged: BTreeMap::new(),
    };
    let out = f(&mut tx)?;
    tx.commit()?;
    Ok(out)
  }

  fn close(&self) -> Result<()> {
    self.db.flush().map_err(ChainError::io)?;
    debug!("sled store flushed");
    Ok(())
  }
}
