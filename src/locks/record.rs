//! Lock records and the names/keys they are stored under.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};

/// Store id of the critical section guarding lock database mutation.
/// Never hashed, so every agent agrees on it regardless of backend.
pub const CRITICAL_SECTION_ID: &str = "CF_CRITICAL_SECTION";

/// Marker record holding the time of the last purge pass.
pub const LOCK_HORIZON_KEY: &str = "lock_horizon";

/// Lock names that must survive purging (license tracking).
const RETAINED_PREFIXES: [&str; 2] = [
    "lock.track_license_bundle.track_license",
    "last.internal_bundle.track_license.handle",
];

/// First byte of a hashed key whose name is retained.
const RETAINED_HASH_MARK: u8 = b'X';

/// Hex characters kept from the name digest when a key must be hashed.
const HASHED_KEY_LEN: usize = 32;

/// Value stored for every lock name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Unix seconds
    pub time: i64,
    /// Unix seconds; `None` when the holder's start time could not be read
    pub process_start_time: Option<i64>,
}

impl LockRecord {
    pub fn new(pid: u32, time: i64, process_start_time: Option<i64>) -> Self {
        Self {
            pid,
            time,
            process_start_time,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Fixed-size plain-old-data; bincode cannot fail on it
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(key: &[u8], bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::CorruptRecord {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }
}

/// The "current" and "last completed" names of one logical lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockNames {
    pub lock: String,
    pub last: String,
}

impl LockNames {
    /// Build `lock.<bundle>.<operator>.<operand>_<sum>_<digest>` and its `last.` twin.
    ///
    /// `operator` and `operand` must already be canonified and date-scrubbed;
    /// bundle and operand are cut at 100 characters.
    pub fn new(bundle: &str, operator: &str, operand: &str, digest: &str) -> Self {
        let sum = classic_sum(operator, operand);
        let bundle = truncate_chars(bundle, 100);
        let operand = truncate_chars(operand, 100);
        let tail = format!("{}.{}.{}_{}_{}", bundle, operator, operand, sum, digest);
        Self {
            lock: format!("lock.{}", tail),
            last: format!("last.{}", tail),
        }
    }
}

const MACRO_ALPHABET: u32 = 61;
const HASH_TABLE_SIZE: u32 = 8192;

/// The agent's historic string bucket hash, kept in lock names for compatibility.
pub fn classic_sum(operator: &str, operand: &str) -> u32 {
    operator
        .bytes()
        .chain(operand.bytes())
        .fold(0u32, |sum, c| (MACRO_ALPHABET * sum + c as u32) % HASH_TABLE_SIZE)
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Derive the store key for a lock name.
///
/// Names that fit the backend are stored verbatim. Longer names are replaced
/// by a digest; retained (license) names get a marked digest so the purger
/// can still recognise them.
pub fn store_key(name: &str, max_key_len: usize) -> Vec<u8> {
    if name == CRITICAL_SECTION_ID || name.len() <= max_key_len {
        return name.as_bytes().to_vec();
    }

    let digest = blake3::hash(name.as_bytes());
    let mut key = digest.to_hex().as_bytes()[..HASHED_KEY_LEN].to_vec();
    if is_retained_name(name) {
        key[0] = RETAINED_HASH_MARK;
    }
    key
}

fn is_retained_name(name: &str) -> bool {
    RETAINED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Whether a raw store key belongs to a record the purger must keep.
pub fn is_retained_key(key: &[u8]) -> bool {
    if key.len() == HASHED_KEY_LEN && key[0] == RETAINED_HASH_MARK {
        return true;
    }
    RETAINED_PREFIXES
        .iter()
        .any(|p| key.starts_with(p.as_bytes()))
}

/// Replace every non-alphanumeric byte with `_`.
pub fn canonify(s: &str) -> String {
    s.bytes()
        .map(|b| if b.is_ascii_alphanumeric() { b as char } else { '_' })
        .collect()
}
