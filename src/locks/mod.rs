//! Promise locking.
//!
//! Agents on one host share a lock database. Every update to it happens
//! inside a store-backed critical section; see [`engine`] for the
//! acquisition rules and [`purge`] for eviction.

pub mod clock;
pub mod critical;
pub mod database;
pub mod dates;
pub mod engine;
pub mod fingerprint;
pub mod process;
pub mod purge;
pub mod record;
pub mod stack;

pub use clock::{Clock, ManualClock, SystemClock};
pub use critical::CriticalSection;
pub use database::LockDatabase;
pub use dates::remove_dates;
pub use engine::{
    derive_names, get_lock_name, LockHandle, LockManager, LockOutcome, LockSettings,
    TransactionContext,
};
pub use fingerprint::{
    promise_runtime_hash, Constraint, Fingerprint, FnCall, HashMethod, Promise, Rval,
};
pub use process::{ProcessControl, SystemProcesses};
pub use purge::{purge_locks, PurgeReport};
pub use record::{LockNames, LockRecord, CRITICAL_SECTION_ID};
pub use stack::LockStack;
