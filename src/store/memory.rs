//! In-process store.
//!
//! Shares nothing across processes. Used for dry runs and tests, and as the
//! backend when locks are kept only for the lifetime of one agent run.

use super::{check_key, KvStore, ScanAction, DEFAULT_MAX_KEY_LEN};
use crate::error::StoreError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Mutex;

pub struct MemoryStore {
    records: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    // -1 means unknown
    usage: AtomicI16,
    max_key_len: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            usage: AtomicI16::new(0),
            max_key_len: DEFAULT_MAX_KEY_LEN,
        }
    }

    pub fn with_max_key_len(mut self, max_key_len: usize) -> Self {
        self.max_key_len = max_key_len;
        self
    }

    /// Pin the reported fill ratio (`None` = unknown).
    pub fn set_usage_percent(&self, usage: Option<u8>) {
        let raw = usage.map(|u| u.min(100) as i16).unwrap_or(-1);
        self.usage.store(raw, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        // A panicking visitor must not wedge every later caller
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KvStore for MemoryStore {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        check_key(self, key)?;
        Ok(self.lock().get(key).cloned())
    }

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        check_key(self, key)?;
        self.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        check_key(self, key)?;
        self.lock().remove(key);
        Ok(())
    }

    fn overwrite_if(
        &self,
        key: &[u8],
        value: &[u8],
        predicate: &dyn Fn(Option<&[u8]>) -> bool,
    ) -> Result<bool, StoreError> {
        check_key(self, key)?;
        let mut records = self.lock();
        if !predicate(records.get(key).map(Vec::as_slice)) {
            return Ok(false);
        }
        records.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    fn scan(
        &self,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> ScanAction,
    ) -> Result<usize, StoreError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|key, value| visitor(key, value) == ScanAction::Keep);
        Ok(before - records.len())
    }

    fn usage_percent(&self) -> Option<u8> {
        let raw = self.usage.load(Ordering::Relaxed);
        (raw >= 0).then_some(raw as u8)
    }

    fn max_key_len(&self) -> usize {
        self.max_key_len
    }
}
