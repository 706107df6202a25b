//! # busraft-storage
//!
//! why: provide durable key-value persistence for the consensus engine's state
//! relations: used by busraft-core for the term/vote/log records, mapped to
//! whatever nonvolatile memory the target platform offers
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed storage file: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid storage key")]
    InvalidKey,
}

/// trait for durable key-value storage of consensus state
///
/// Values are small byte strings (a term, an index, a node id, a serialized
/// log entry). A `set` must not return `Ok` until the value is durable; the
/// engine relies on that to keep its in-memory state in lockstep with the
/// medium.
///
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing, diskless nodes)
pub trait Storage {
    /// read the value stored under `key`, or None if the key was never set
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// durably store `value` under `key`, overwriting any previous value
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
}

fn check_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(StorageError::InvalidKey);
    }
    Ok(())
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// keeps the whole key-value map in one `state.json` file; every `set`
/// rewrites it atomically (temp file, fsync, rename), so a crash mid-write
/// leaves the previous state intact
pub struct FileStorage {
    dir: PathBuf,
    map: BTreeMap<String, Vec<u8>>,
}

impl FileStorage {
    /// open storage rooted at the given directory, creating it if needed
    /// and loading any previously persisted state
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let path = dir.join("state.json");
        let map = if path.exists() {
            let mut contents = String::new();
            File::open(&path)?.read_to_string(&mut contents)?;
            serde_json::from_str(&contents)?
        } else {
            BTreeMap::new()
        };

        Ok(Self { dir, map })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn persist(&self, map: &BTreeMap<String, Vec<u8>>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(map)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;

        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;

        // persist first; the in-memory map only changes once the file is safe
        let mut next = self.map.clone();
        next.insert(key.to_owned(), value.to_vec());
        self.persist(&next)?;
        self.map = next;

        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing and diskless deployments
///
/// no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    map: BTreeMap<String, Vec<u8>>,
}

impl InMemoryStorage {
    /// create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        self.map.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn in_memory_get_returns_none_for_missing_key() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.get("current_term").unwrap(), None);
    }

    #[test]
    fn in_memory_set_then_get() {
        let mut storage = InMemoryStorage::new();

        storage.set("current_term", &[5, 0, 0, 0]).unwrap();

        assert_eq!(storage.get("current_term").unwrap(), Some(vec![5, 0, 0, 0]));
    }

    #[test]
    fn in_memory_set_overwrites() {
        let mut storage = InMemoryStorage::new();

        storage.set("voted_for", &[1]).unwrap();
        storage.set("voted_for", &[2]).unwrap();

        assert_eq!(storage.get("voted_for").unwrap(), Some(vec![2]));
    }

    #[test]
    fn empty_key_is_rejected() {
        let mut storage = InMemoryStorage::new();
        assert!(matches!(storage.set("", &[1]), Err(StorageError::InvalidKey)));
        assert!(matches!(storage.get(""), Err(StorageError::InvalidKey)));
    }

    #[test]
    fn key_with_invalid_characters_is_rejected() {
        let mut storage = InMemoryStorage::new();
        assert!(matches!(storage.set("log entry", &[1]), Err(StorageError::InvalidKey)));
    }

    #[test]
    fn file_storage_set_then_get() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();

        storage.set("log0", &[0; 21]).unwrap();

        assert_eq!(storage.get("log0").unwrap(), Some(vec![0; 21]));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.set("cluster_size", &[3]).unwrap();
        }

        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get("cluster_size").unwrap(), Some(vec![3]));
    }
}
