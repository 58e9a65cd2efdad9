use cfsync::locks::{
    Clock, LockDatabase, LockManager, LockOutcome, LockRecord, LockSettings, ManualClock, Promise,
    PurgeReport, TransactionContext,
};
use cfsync::store::{FjallStore, KvStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const HOST: &str = "agent-host";

fn promise() -> Promise {
    Promise::new("commands", "nightly", "/usr/local/bin/rotate-logs")
        .with_constraint("ifelapsed", "60")
        .with_constraint("expireafter", "120")
}

fn settings() -> LockSettings {
    LockSettings {
        critical_section_timeout: Duration::from_secs(5),
        ..LockSettings::default()
    }
}

/// A fresh agent invocation against the shared database.
fn agent(path: &std::path::Path, clock: &Arc<ManualClock>) -> LockManager {
    let store = FjallStore::open(path, 1 << 30).unwrap();
    LockManager::new(Arc::new(store), settings()).with_clock(clock.clone())
}

#[test]
fn test_ifelapsed_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("cf_lock");
    let clock = Arc::new(ManualClock::new(1_000_000));
    let tc = TransactionContext::new(60, 120);

    {
        let mut first = agent(&db, &clock);
        let outcome = first.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
        assert!(outcome.should_proceed());
        first.yield_current_lock(outcome);
    }

    // Thirty minutes later a new agent finds the promise recently kept
    clock.set(1_000_000 + 30 * 60);
    {
        let mut second = agent(&db, &clock);
        let outcome = second.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
        assert_eq!(outcome, LockOutcome::Skip);
    }

    clock.set(1_000_000 + 61 * 60);
    let mut third = agent(&db, &clock);
    let outcome = third.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
    assert!(outcome.should_proceed());
    third.yield_current_lock(outcome);
}

#[test]
fn test_concurrent_agents_exclude_each_other() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("cf_lock");
    let clock = Arc::new(ManualClock::new(2_000_000));
    let tc = TransactionContext::new(0, 120);

    let mut a = agent(&db, &clock);
    let mut b = agent(&db, &clock);

    let held = a.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
    assert!(held.should_proceed());

    // Same process id, still running and inside the expiry allowance
    let refused = b.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
    assert_eq!(refused, LockOutcome::Skip);

    a.yield_current_lock(held);
    b.begin_pass();
    let taken = b.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
    assert!(taken.should_proceed());
    b.yield_current_lock(taken);
}

#[test]
fn test_crashed_holder_is_reclaimed() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("cf_lock");
    let clock = Arc::new(ManualClock::new(3_000_000));
    let tc = TransactionContext::new(0, 10);

    let mut mgr = agent(&db, &clock);
    let names = mgr.lock_names("rotate", HOST, &promise());

    // A holder that died an hour ago without releasing
    let dead = LockRecord::new(4_999_999, 3_000_000 - 3600, Some(1));
    mgr.database().write(&names.lock, &dead).unwrap();

    let outcome = mgr.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
    assert!(outcome.should_proceed());
    let record = mgr.database().read(&names.lock).unwrap().unwrap();
    assert_eq!(record.pid, std::process::id());
    mgr.yield_current_lock(outcome);
    assert!(mgr.database().read(&names.lock).unwrap().is_none());
}

#[test]
fn test_drop_releases_unyielded_locks() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("cf_lock");
    let clock = Arc::new(ManualClock::new(4_000_000));
    let tc = TransactionContext::new(0, 120);

    let names = {
        let mut mgr = agent(&db, &clock);
        let outcome = mgr.acquire_lock("rotate", HOST, clock.now(), tc, &promise(), false);
        assert!(outcome.should_proceed());
        // Dropped while still holding the lock
        mgr.lock_names("rotate", HOST, &promise())
    };

    let store = FjallStore::open(&db, 1 << 30).unwrap();
    let check = LockDatabase::new(Arc::new(store));
    assert!(check.read(&names.lock).unwrap().is_none());
    assert_eq!(check.find_lock_time(&names.last).unwrap(), Some(4_000_000));
}

#[test]
fn test_purge_respects_horizon_and_marker() {
    let store = Arc::new(MemoryStore::new());
    store.set_usage_percent(Some(90));
    let clock = Arc::new(ManualClock::new(10_000_000));
    let mgr = LockManager::new(store.clone(), settings()).with_clock(clock.clone());

    let week = 7 * 24 * 3600;
    let db = mgr.database();
    db.write("last.old", &LockRecord::new(1, 10_000_000 - 2 * week, None))
        .unwrap();
    db.write("last.fresh", &LockRecord::new(1, 10_000_000 - 60, None))
        .unwrap();

    assert_eq!(
        mgr.purge_locks(),
        PurgeReport::Purged {
            horizon_secs: week,
            deleted: 1
        }
    );
    assert!(db.read("last.old").unwrap().is_none());
    assert!(db.read("last.fresh").unwrap().is_some());

    // The marker holds off another pass until the horizon has gone by
    clock.advance(3600);
    assert_eq!(
        mgr.purge_locks(),
        PurgeReport::NotDue { horizon_secs: week }
    );
    assert!(store.usage_percent().is_some());
}
