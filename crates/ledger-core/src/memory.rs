//! In-memory [`ChainStore`] for tests and throwaway chains.

use crate::chain::{ChainStore, ReadTx, WriteTx};
use crate::{ChainError, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
pub struct MemStore {
    buckets: RwLock<BTreeMap<String, Bucket>>,
    writer: Mutex<()>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemReadTx<'a> {
    buckets: &'a BTreeMap<String, Bucket>,
}

impl ReadTx for MemReadTx<'_> {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.contains_key(bucket))
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn count(&self, bucket: &str) -> Result<usize> {
        Ok(self.buckets.get(bucket).map_or(0, |b| b.len()))
    }
}

struct MemWriteTx<'a> {
    base: &'a RwLock<BTreeMap<String, Bucket>>,
    staged: BTreeMap<String, Bucket>,
}

impl MemWriteTx<'_> {
    fn committed<T>(&self, f: impl FnOnce(&BTreeMap<String, Bucket>) -> T) -> Result<T> {
        let buckets = self
            .base
            .read()
            .map_err(|_| ChainError::io("memory store lock poisoned"))?;
        Ok(f(&buckets))
    }
}

impl ReadTx for MemWriteTx<'_> {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        if self.staged.contains_key(bucket) {
            return Ok(true);
        }
        self.committed(|b| b.contains_key(bucket))
    }

    fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.staged.get(bucket).and_then(|b| b.get(key)) {
            return Ok(Some(value.clone()));
        }
        self.committed(|b| b.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn count(&self, bucket: &str) -> Result<usize> {
        let staged = self.staged.get(bucket);
        self.committed(|b| match (b.get(bucket), staged) {
            (Some(base), Some(staged)) => {
                base.len() + staged.keys().filter(|k| !base.contains_key(*k)).count()
            }
            (Some(base), None) => base.len(),
            (None, Some(staged)) => staged.len(),
            (None, None) => 0,
        })
    }
}

impl WriteTx for MemWriteTx<'_> {
    fn create_bucket_if_absent(&mut self, bucket: &str) -> Result<()> {
        self.staged.entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.bucket_exists(bucket)? {
            return Err(ChainError::io(format!("bucket {bucket} does not exist")));
        }
        self.staged
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

impl ChainStore for MemStore {
    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ReadTx) -> Result<T>,
    {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| ChainError::io("memory store lock poisoned"))?;
        f(&MemReadTx { buckets: &buckets })
    }

    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn WriteTx) -> Result<T>,
    {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| ChainError::io("memory store writer lock poisoned"))?;
        let mut tx = MemWriteTx {
            base: &self.buckets,
            staged: BTreeMap::new(),
        };
        let out = f(&mut tx)?;

        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| ChainError::io("memory store lock poisoned"))?;
        for (name, writes) in tx.staged {
            buckets.entry(name).or_default().extend(writes);
        }
        Ok(out)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commits_all_or_nothing() {
        let store = MemStore::new();
        store
            .write(|tx| {
                tx.create_bucket_if_absent("b")?;
                tx.put("b", b"k1", b"v1")
            })
            .unwrap();

        let res: Result<()> = store.write(|tx| {
            tx.put("b", b"k2", b"v2")?;
            Err(ChainError::io("boom"))
        });
        assert!(res.is_err());

        let (k1, k2) = store
            .read(|tx| Ok((tx.get("b", b"k1")?, tx.get("b", b"k2")?)))
            .unwrap();
        assert_eq!(k1, Some(b"v1".to_vec()));
        assert_eq!(k2, None);
    }

    #[test]
    fn staged_writes_visible_inside_transaction_only() {
        let store = MemStore::new();
        store
            .write(|tx| {
                tx.create_bucket_if_absent("b")?;
                assert!(tx.bucket_exists("b")?);
                tx.put("b", b"k", b"v")?;
                assert_eq!(tx.get("b", b"k")?, Some(b"v".to_vec()));
                assert_eq!(tx.count("b")?, 1);
                let outside = store.read(|r| r.get("b", b"k"));
                assert_eq!(outside.unwrap(), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read(|tx| tx.count("b")).unwrap(), 1);
    }

    #[test]
    fn put_into_missing_bucket_fails() {
        let store = MemStore::new();
        let err = store.write(|tx| tx.put("nope", b"k", b"v")).unwrap_err();
        assert!(matches!(err, ChainError::StoreIo(_)));
    }

    #[test]
    fn create_bucket_is_idempotent() {
        let store = MemStore::new();
        store
            .write(|tx| {
                tx.create_bucket_if_absent("b")?;
                tx.put("b", b"k", b"v")
            })
            .unwrap();
        store.write(|tx| tx.create_bucket_if_absent("b")).unwrap();
        assert_eq!(
            store.read(|tx| tx.get("b", b"k")).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn count_merges_staged_and_committed_keys() {
        let store = MemStore::new();
        store
            .write(|tx| {
                tx.create_bucket_if_absent("b")?;
                tx.put("b", b"a", b"1")?;
                tx.put("b", b"b", b"2")
            })
            .unwrap();
        store
            .write(|tx| {
                tx.put("b", b"b", b"3")?;
                tx.put("b", b"c", b"4")?;
                assert_eq!(tx.count("b")?, 3);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.read(|tx| tx.count("b")).unwrap(), 3);
    }
}
