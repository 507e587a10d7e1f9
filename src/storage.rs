//! # Versioned Key/Value Store Facade
//!
//! Thin wrapper around an embedded [`sled`] database. Every other component
//! talks to this narrow surface only: get / put / delete / iterate / close.
//!
//! The store carries a schema version under the reserved key `"version"`
//! (u32, little-endian). Opening with a different version purges the
//! directory and recreates it — persisted discovery data is a cache, not a
//! source of truth, so wiping on schema change is always safe.
//!
//! When no path is given, a temporary in-memory database backs the store.
//! The discovery stack uses this as a fallback when the configured database
//! directory cannot be opened.

use std::path::{Path, PathBuf};

use tracing::warn;

/// Reserved key holding the schema version tag.
const VERSION_KEY: &[u8] = b"version";

/// Read/write failures surfaced by the store. Callers treat read errors as
/// absent values; only open-time failures are fatal.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Backend(#[from] sled::Error),
    #[error("storage directory purge: {0}")]
    Purge(#[from] std::io::Error),
}

/// Versioned byte-keyed store with iteration.
pub struct Storage {
    db: sled::Db,
    path: Option<PathBuf>,
}

impl Storage {
    /// Opens (or creates) the store at `path`, purging it first if the
    /// persisted version tag differs from `version`. An empty `path` opens
    /// a temporary in-memory store.
    pub fn open(path: Option<&Path>, version: u32) -> Result<Self, StorageError> {
        let db = Self::open_backend(path)?;
        let want = version.to_le_bytes();
        match db.get(VERSION_KEY)? {
            None => {
                db.insert(VERSION_KEY, &want)?;
            }
            Some(got) if got.as_ref() != want => {
                // Schema changed underneath us. Throw the directory away and
                // start from scratch.
                drop(db);
                if let Some(p) = path {
                    warn!(path = %p.display(), "node database version mismatch, purging");
                    std::fs::remove_dir_all(p)?;
                }
                let db = Self::open_backend(path)?;
                db.insert(VERSION_KEY, &want)?;
                return Ok(Self {
                    db,
                    path: path.map(Path::to_path_buf),
                });
            }
            Some(_) => {}
        }
        Ok(Self {
            db,
            path: path.map(Path::to_path_buf),
        })
    }

    fn open_backend(path: Option<&Path>) -> Result<sled::Db, sled::Error> {
        match path {
            Some(p) => sled::open(p),
            None => sled::Config::new().temporary(true).open(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db.remove(key)?;
        Ok(())
    }

    /// Iterates all key/value pairs in key order. The iterator owns its
    /// cursor and stays valid across writes; errors on individual entries
    /// end the iteration.
    pub fn iter(&self) -> StorageIter {
        StorageIter(self.db.iter())
    }

    /// Flushes outstanding writes. Dropping the store also releases it; an
    /// explicit close exists so the owner can order shutdown.
    pub fn close(&self) {
        if let Err(err) = self.db.flush() {
            warn!(error = %err, "storage flush on close failed");
        }
    }
}

/// Owned cursor over the whole store, in key order.
pub struct StorageIter(sled::Iter);

impl Iterator for StorageIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for kv in self.0.by_ref() {
            if let Ok((k, v)) = kv {
                return Some((k.to_vec(), v.to_vec()));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = Storage::open(None, 1).unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let store = Storage::open(None, 1).unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();
        let keys: Vec<_> = store
            .iter()
            .map(|(k, _)| k)
            .filter(|k| k != VERSION_KEY)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn version_mismatch_purges() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Storage::open(Some(dir.path()), 1).unwrap();
            store.put(b"n:x", b"old").unwrap();
            store.close();
        }
        {
            // Same version: data survives.
            let store = Storage::open(Some(dir.path()), 1).unwrap();
            assert_eq!(store.get(b"n:x").unwrap(), Some(b"old".to_vec()));
            store.close();
        }
        {
            // Bumped version: directory purged.
            let store = Storage::open(Some(dir.path()), 2).unwrap();
            assert_eq!(store.get(b"n:x").unwrap(), None);
        }
    }
}
