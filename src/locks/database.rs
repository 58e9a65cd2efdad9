//! Lock records on top of a [`KvStore`].

use super::record::{store_key, LockRecord};
use crate::error::StoreError;
use crate::store::KvStore;
use std::sync::Arc;
use tracing::trace;

#[derive(Clone)]
pub struct LockDatabase {
    store: Arc<dyn KvStore>,
}

impl LockDatabase {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn KvStore {
        self.store.as_ref()
    }

    /// Key a lock name is stored under in this backend.
    pub fn key(&self, name: &str) -> Vec<u8> {
        store_key(name, self.store.max_key_len())
    }

    pub fn read(&self, name: &str) -> Result<Option<LockRecord>, StoreError> {
        let key = self.key(name);
        let record = match self.store.read(&key)? {
            Some(bytes) => Some(LockRecord::decode(&key, &bytes)?),
            None => None,
        };
        trace!(
            lock = name,
            key = %String::from_utf8_lossy(&key),
            ?record,
            "Read lock record"
        );
        Ok(record)
    }

    pub fn write(&self, name: &str, record: &LockRecord) -> Result<(), StoreError> {
        let key = self.key(name);
        trace!(
            lock = name,
            key = %String::from_utf8_lossy(&key),
            pid = record.pid,
            time = record.time,
            "Writing lock record"
        );
        self.store.write(&key, &record.encode())
    }

    /// Write `record` unless a live record younger than `max_age` seconds
    /// (relative to `record.time`) is present. Unreadable records count as
    /// absent. Returns whether the write happened.
    pub fn write_unless_fresh(
        &self,
        name: &str,
        record: &LockRecord,
        max_age: i64,
    ) -> Result<bool, StoreError> {
        let key = self.key(name);
        let now = record.time;
        let predicate = |old: Option<&[u8]>| match old {
            None => true,
            Some(bytes) => match LockRecord::decode(&key, bytes) {
                Ok(held) => now - held.time >= max_age,
                Err(_) => true,
            },
        };
        let written = self.store.overwrite_if(&key, &record.encode(), &predicate)?;
        trace!(lock = name, written, "Conditional lock write");
        Ok(written)
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let key = self.key(name);
        trace!(lock = name, key = %String::from_utf8_lossy(&key), "Removing lock record");
        self.store.delete(&key)
    }

    /// Time stored under `name`, `None` when there is no record.
    pub fn find_lock_time(&self, name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.read(name)?.map(|r| r.time))
    }
}
