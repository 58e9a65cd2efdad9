//! Horizon-based eviction of old lock records.
//!
//! The fuller the store, the shorter records are kept. A marker record
//! remembers the last pass so restarts in a tight loop do not rescan.

use super::clock::Clock;
use super::critical::CriticalSection;
use super::database::LockDatabase;
use super::record::{is_retained_key, LockRecord, CRITICAL_SECTION_ID, LOCK_HORIZON_KEY};
use crate::store::ScanAction;
use std::time::Duration;
use tracing::{debug, trace, warn};

const SECONDS_PER_WEEK: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeReport {
    /// Store usage is low enough that nothing is evicted.
    Disabled,
    /// The previous pass is more recent than the horizon.
    NotDue { horizon_secs: i64 },
    Purged { horizon_secs: i64, deleted: usize },
    /// The store could not be scanned.
    Failed,
}

/// Retention horizon for a store fill ratio; `None` means keep everything.
/// An unknown ratio gets the longest horizon.
pub fn horizon_for_usage(usage_percent: Option<u8>) -> Option<i64> {
    match usage_percent {
        None => Some(4 * SECONDS_PER_WEEK),
        Some(p) if p < 25 => None,
        Some(p) if p < 50 => Some(4 * SECONDS_PER_WEEK),
        Some(p) if p < 75 => Some(2 * SECONDS_PER_WEEK),
        Some(_) => Some(SECONDS_PER_WEEK),
    }
}

pub fn purge_locks(
    db: &LockDatabase,
    clock: &dyn Clock,
    pid: u32,
    critical_section_timeout: Duration,
) -> PurgeReport {
    let usage = db.store().usage_percent();
    let horizon = match horizon_for_usage(usage) {
        Some(h) => h,
        None => {
            debug!("Lock database usage {:?}%, no purging needed", usage);
            return PurgeReport::Disabled;
        }
    };

    let now = clock.now();
    match db.find_lock_time(LOCK_HORIZON_KEY) {
        Ok(Some(last_pass)) if now - last_pass < horizon => {
            debug!("No lock purging scheduled");
            return PurgeReport::NotDue {
                horizon_secs: horizon,
            };
        }
        Ok(_) => {}
        Err(e) => warn!("Unable to read lock purge marker: {}", e),
    }

    debug!("Looking for stale locks to purge");

    let section = CriticalSection::new(CRITICAL_SECTION_ID, critical_section_timeout);
    let _guard = section.enter(db, clock, pid);

    let mut visitor = |key: &[u8], value: &[u8]| {
        if key == LOCK_HORIZON_KEY.as_bytes()
            || key == CRITICAL_SECTION_ID.as_bytes()
            || is_retained_key(key)
        {
            return ScanAction::Keep;
        }
        match LockRecord::decode(key, value) {
            Ok(record) if now - record.time > horizon => {
                debug!(
                    "Purging lock ({} s elapsed): {}",
                    now - record.time,
                    String::from_utf8_lossy(key)
                );
                ScanAction::Delete
            }
            Ok(_) => ScanAction::Keep,
            Err(e) => {
                trace!("{}", e);
                ScanAction::Delete
            }
        }
    };

    let deleted = match db.store().scan(&mut visitor) {
        Ok(n) => n,
        Err(e) => {
            warn!("Unable to scan lock database: {}", e);
            return PurgeReport::Failed;
        }
    };

    debug!("Finished purging locks");

    // Updated even when nothing was deleted
    if let Err(e) = db.write(LOCK_HORIZON_KEY, &LockRecord::new(pid, now, None)) {
        warn!("Unable to update lock purge marker: {}", e);
    }

    PurgeReport::Purged {
        horizon_secs: horizon,
        deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::clock::ManualClock;
    use crate::store::{KvStore, MemoryStore};
    use std::sync::Arc;

    const NOW: i64 = 100 * SECONDS_PER_WEEK;

    fn setup(usage: u8) -> (Arc<MemoryStore>, LockDatabase, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        store.set_usage_percent(Some(usage));
        let db = LockDatabase::new(store.clone());
        (store, db, ManualClock::new(NOW))
    }

    fn purge(db: &LockDatabase, clock: &ManualClock) -> PurgeReport {
        purge_locks(db, clock, 1, Duration::from_secs(60))
    }

    #[test]
    fn test_horizon_steps() {
        assert_eq!(horizon_for_usage(Some(0)), None);
        assert_eq!(horizon_for_usage(Some(24)), None);
        assert_eq!(horizon_for_usage(Some(25)), Some(4 * SECONDS_PER_WEEK));
        assert_eq!(horizon_for_usage(Some(60)), Some(2 * SECONDS_PER_WEEK));
        assert_eq!(horizon_for_usage(Some(100)), Some(SECONDS_PER_WEEK));
        assert_eq!(horizon_for_usage(None), Some(4 * SECONDS_PER_WEEK));
    }

    #[test]
    fn test_low_usage_disables_purge() {
        let (store, db, clock) = setup(10);
        db.write("lock.old", &LockRecord::new(1, 0, None)).unwrap();
        assert_eq!(purge(&db, &clock), PurgeReport::Disabled);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_old_records_purged() {
        let (store, db, clock) = setup(80);
        db.write("lock.old", &LockRecord::new(1, NOW - 2 * SECONDS_PER_WEEK, None))
            .unwrap();
        db.write("last.recent", &LockRecord::new(1, NOW - 3600, None))
            .unwrap();
        db.write(
            "last.internal_bundle.track_license.handle.x",
            &LockRecord::new(1, 0, None),
        )
        .unwrap();
        store.write(b"garbage", b"?").unwrap();

        assert_eq!(
            purge(&db, &clock),
            PurgeReport::Purged {
                horizon_secs: SECONDS_PER_WEEK,
                deleted: 2
            }
        );
        assert!(db.read("lock.old").unwrap().is_none());
        assert!(db.read("last.recent").unwrap().is_some());
        assert!(db
            .read("last.internal_bundle.track_license.handle.x")
            .unwrap()
            .is_some());
        assert_eq!(db.find_lock_time(LOCK_HORIZON_KEY).unwrap(), Some(NOW));
        // Critical section was released
        assert!(db.read(CRITICAL_SECTION_ID).unwrap().is_none());
    }

    #[test]
    fn test_marker_suppresses_rescan() {
        let (_, db, clock) = setup(80);
        assert!(matches!(purge(&db, &clock), PurgeReport::Purged { deleted: 0, .. }));

        db.write("lock.old", &LockRecord::new(1, 0, None)).unwrap();
        clock.advance(3600);
        assert_eq!(
            purge(&db, &clock),
            PurgeReport::NotDue {
                horizon_secs: SECONDS_PER_WEEK
            }
        );
        assert!(db.read("lock.old").unwrap().is_some());

        clock.advance(SECONDS_PER_WEEK);
        assert!(matches!(purge(&db, &clock), PurgeReport::Purged { deleted: 1, .. }));
    }
}
