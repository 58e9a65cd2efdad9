//! Lock database backed by fjall.
//!
//! fjall keyspaces are single-process, while the lock database is shared by
//! every agent on the host. Each operation therefore takes an exclusive
//! advisory lock on a sidecar file, opens the keyspace, runs, persists and
//! closes again. Lock traffic is small, so the reopen cost is acceptable.

use super::{check_key, KvStore, ScanAction};
use crate::error::StoreError;
use ::fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const PARTITION: &str = "locks";

pub struct FjallStore {
    path: PathBuf,
    lock_path: PathBuf,
    max_bytes: u64,
}

/// An open keyspace plus the advisory lock that guards it.
/// Field order matters: the keyspace closes before the lock is released.
struct Session {
    partition: PartitionHandle,
    keyspace: Keyspace,
    _lock: File,
}

impl FjallStore {
    /// Open (creating if needed) the store at `path`.
    ///
    /// `max_bytes` is the size treated as 100% full by [`KvStore::usage_percent`].
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self, StoreError> {
        fs::create_dir_all(path)?;
        let store = Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
            max_bytes: max_bytes.max(1),
        };
        // Fail early on an unusable directory
        drop(store.session()?);
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn session(&self) -> Result<Session, StoreError> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        lock.lock_exclusive()?;

        let keyspace = ::fjall::Config::new(&self.path).open()?;
        let partition = keyspace.open_partition(PARTITION, PartitionCreateOptions::default())?;

        Ok(Session {
            partition,
            keyspace,
            _lock: lock,
        })
    }

    fn with_session<T>(
        &self,
        persist: bool,
        f: impl FnOnce(&Session) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let session = self.session()?;
        let out = f(&session)?;
        if persist {
            session.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(out)
    }
}

impl KvStore for FjallStore {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(self, key)?;
        self.with_session(false, |s| Ok(s.partition.get(key)?.map(|v| v.to_vec())))
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        check_key(self, key)?;
        self.with_session(true, |s| {
            s.partition.insert(key, value)?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        check_key(self, key)?;
        self.with_session(true, |s| {
            s.partition.remove(key)?;
            Ok(())
        })
    }

    fn overwrite_if(
        &self,
        key: &[u8],
        value: &[u8],
        predicate: &dyn Fn(Option<&[u8]>) -> bool,
    ) -> Result<bool, StoreError> {
        check_key(self, key)?;
        // The session lock makes read-check-write atomic across processes
        self.with_session(true, |s| {
            let current = s.partition.get(key)?;
            if !predicate(current.as_deref()) {
                return Ok(false);
            }
            s.partition.insert(key, value)?;
            Ok(true)
        })
    }

    fn scan(
        &self,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> ScanAction,
    ) -> Result<usize, StoreError> {
        self.with_session(true, |s| {
            let mut deleted = 0;
            // The iterator reads a snapshot, so removing while iterating is safe
            for item in s.partition.iter() {
                let (key, value) = item?;
                if visitor(&key, &value) == ScanAction::Delete {
                    s.partition.remove(&*key)?;
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
    }

    fn usage_percent(&self) -> Option<u8> {
        match self.session() {
            Ok(session) => {
                let used = session.keyspace.disk_space();
                Some((used.saturating_mul(100) / self.max_bytes).min(100) as u8)
            }
            Err(e) => {
                tracing::warn!("Unable to determine lock database usage: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FjallStore::open(&tmp.path().join("db"), 1 << 20).unwrap();

        assert!(store.read(b"lock.a").unwrap().is_none());
        store.write(b"lock.a", b"value").unwrap();
        assert_eq!(store.read(b"lock.a").unwrap().as_deref(), Some(&b"value"[..]));

        store.delete(b"lock.a").unwrap();
        assert!(store.read(b"lock.a").unwrap().is_none());
    }

    #[test]
    fn test_visible_across_handles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db");
        let first = FjallStore::open(&path, 1 << 20).unwrap();
        let second = FjallStore::open(&path, 1 << 20).unwrap();

        first.write(b"shared", b"1").unwrap();
        assert_eq!(second.read(b"shared").unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn test_overwrite_if() {
        let tmp = TempDir::new().unwrap();
        let store = FjallStore::open(&tmp.path().join("db"), 1 << 20).unwrap();

        assert!(store.overwrite_if(b"k", b"1", &|old| old.is_none()).unwrap());
        assert!(!store.overwrite_if(b"k", b"2", &|old| old.is_none()).unwrap());
        assert_eq!(store.read(b"k").unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn test_scan_deletes() {
        let tmp = TempDir::new().unwrap();
        let store = FjallStore::open(&tmp.path().join("db"), 1 << 20).unwrap();
        store.write(b"keep.1", b"x").unwrap();
        store.write(b"drop.1", b"x").unwrap();
        store.write(b"drop.2", b"x").unwrap();

        let deleted = store
            .scan(&mut |key, _| {
                if key.starts_with(b"drop.") {
                    ScanAction::Delete
                } else {
                    ScanAction::Keep
                }
            })
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(store.read(b"keep.1").unwrap().is_some());
        assert!(store.read(b"drop.2").unwrap().is_none());
    }

    #[test]
    fn test_key_limit() {
        let tmp = TempDir::new().unwrap();
        let store = FjallStore::open(&tmp.path().join("db"), 1 << 20).unwrap();
        let key = vec![b'k'; store.max_key_len() + 1];
        assert!(matches!(
            store.write(&key, b"v"),
            Err(StoreError::KeyTooLong { .. })
        ));
    }
}
