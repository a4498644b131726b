#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use ledger_core::Chain;
use ledger_storage::SledStore;
use tempfile::{tempdir, TempDir};

pub fn create_temp_dir() -> (TempDir, PathBuf) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("blockchain.db");
    (temp_dir, db_path)
}

pub fn remove_temp_dir(temp_dir: TempDir) {
    let db_path = temp_dir.path().to_path_buf();
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    // Verify the directory is removed
    assert!(!db_path.exists(), "Database directory should be removed");
}

pub fn open_store(db_path: &PathBuf) -> Arc<SledStore> {
    Arc::new(SledStore::open(db_path).expect("Failed to open SledStore"))
}

pub fn open_chain(db_path: &PathBuf) -> Chain<SledStore> {
    Chain::open(open_store(db_path)).expect("Failed to open chain")
}

pub fn hashes(chain: &Chain<SledStore>) -> Vec<String> {
    chain
        .iter()
        .map(|block| hex::encode(block.expect("Traversal should succeed").hash))
        .collect()
}
