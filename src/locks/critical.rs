//! Store-backed named mutex serialising lock database updates.
//!
//! A waiter polls once per second. If the section is still held after the
//! timeout the holder is presumed to have crashed and the section is taken
//! anyway. Two agents that both time out in the same second can then hold
//! it together; the window is accepted so that a crashed agent can never
//! wedge every later run.

use super::clock::Clock;
use super::database::LockDatabase;
use super::record::LockRecord;
use std::time::Duration;
use tracing::{debug, warn};

pub struct CriticalSection<'a> {
    id: &'a str,
    timeout: Duration,
    poll: Duration,
}

impl<'a> CriticalSection<'a> {
    pub fn new(id: &'a str, timeout: Duration) -> Self {
        Self {
            id,
            timeout,
            poll: Duration::from_secs(1),
        }
    }

    pub fn id(&self) -> &str {
        self.id
    }

    /// Block until the section is ours.
    pub fn wait_for(&self, db: &LockDatabase, clock: &dyn Clock, pid: u32) {
        let timeout = self.timeout.as_secs() as i64;

        loop {
            let now = clock.now();
            let record = LockRecord::new(pid, now, None);
            match db.write_unless_fresh(self.id, &record, timeout) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!("Unable to take critical section {}: {}", self.id, e);
                    return;
                }
            }

            match db.find_lock_time(self.id) {
                Ok(Some(then)) if now - then < timeout => {
                    debug!(
                        "Critical section {} held since {}, waiting",
                        self.id, then
                    );
                    clock.sleep(self.poll);
                }
                // Released, expired or unreadable between the two calls
                _ => {
                    if let Err(e) = db.write(self.id, &record) {
                        warn!("Unable to take critical section {}: {}", self.id, e);
                    }
                    return;
                }
            }
        }
    }

    pub fn release(&self, db: &LockDatabase) {
        if let Err(e) = db.remove(self.id) {
            warn!("Unable to release critical section {}: {}", self.id, e);
        }
    }

    /// Enter the section and leave it again when the guard drops.
    pub fn enter<'g>(
        &'g self,
        db: &'g LockDatabase,
        clock: &dyn Clock,
        pid: u32,
    ) -> CriticalGuard<'g> {
        self.wait_for(db, clock, pid);
        CriticalGuard { section: self, db }
    }
}

#[must_use = "the critical section is released when the guard drops"]
pub struct CriticalGuard<'g> {
    section: &'g CriticalSection<'g>,
    db: &'g LockDatabase,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.section.release(self.db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::clock::ManualClock;
    use crate::locks::record::CRITICAL_SECTION_ID;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn db() -> LockDatabase {
        LockDatabase::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_free_section_taken_immediately() {
        let db = db();
        let clock = ManualClock::new(1000);
        let cs = CriticalSection::new(CRITICAL_SECTION_ID, Duration::from_secs(60));

        cs.wait_for(&db, &clock, 7);
        assert_eq!(clock.now(), 1000);
        assert_eq!(db.read(CRITICAL_SECTION_ID).unwrap().map(|r| r.pid), Some(7));

        cs.release(&db);
        assert!(db.read(CRITICAL_SECTION_ID).unwrap().is_none());
    }

    #[test]
    fn test_stuck_section_forced_after_timeout() {
        let db = db();
        let clock = ManualClock::new(1000);
        db.write(CRITICAL_SECTION_ID, &LockRecord::new(99, 1000, None))
            .unwrap();

        let cs = CriticalSection::new(CRITICAL_SECTION_ID, Duration::from_secs(60));
        cs.wait_for(&db, &clock, 7);

        // Polled once a second until the holder looked abandoned
        assert_eq!(clock.now(), 1060);
        assert_eq!(db.read(CRITICAL_SECTION_ID).unwrap().map(|r| r.pid), Some(7));
    }

    #[test]
    fn test_guard_releases() {
        let db = db();
        let clock = ManualClock::new(5);
        let cs = CriticalSection::new("CS_TEST", Duration::from_secs(60));
        {
            let _guard = cs.enter(&db, &clock, 1);
            assert!(db.read("CS_TEST").unwrap().is_some());
        }
        assert!(db.read("CS_TEST").unwrap().is_none());
    }
}
