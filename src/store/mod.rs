//! Persistent key/value store used by the lock engine.
//!
//! The locking logic only sees [`KvStore`]; each backend implements it once.
//! Backends are selected by the caller at construction time.

pub mod disk;
pub mod memory;

pub use self::disk::FjallStore;
pub use self::memory::MemoryStore;

use crate::error::StoreError;

/// Key length limit of the most restrictive backend we interoperate with.
pub const DEFAULT_MAX_KEY_LEN: usize = 511;

/// What a cursor visitor wants done with the record it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Keep,
    Delete,
}

/// Capability interface of an embedded key/value store.
///
/// Implementations must be safe to share between threads; cross-process
/// exclusion is provided by the critical section convention, not by the
/// store (see `locks::critical`).
pub trait KvStore: Send + Sync {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Atomically replace the value under `key` when `predicate` accepts the
    /// current value (`None` when absent). Returns whether the write happened.
    fn overwrite_if(
        &self,
        key: &[u8],
        value: &[u8],
        predicate: &dyn Fn(Option<&[u8]>) -> bool,
    ) -> Result<bool, StoreError>;

    /// Visit every record; the visitor may delete the current record.
    /// Returns the number of deleted records.
    fn scan(
        &self,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> ScanAction,
    ) -> Result<usize, StoreError>;

    /// Fill ratio in percent, `None` when the backend cannot tell.
    fn usage_percent(&self) -> Option<u8>;

    fn max_key_len(&self) -> usize {
        DEFAULT_MAX_KEY_LEN
    }
}

pub(crate) fn check_key(store: &dyn KvStore, key: &[u8]) -> Result<(), StoreError> {
    let max = store.max_key_len();
    if key.len() > max {
        return Err(StoreError::KeyTooLong {
            len: key.len(),
            max,
        });
    }
    Ok(())
}
