//! Promise locks.
//!
//! A promise may only be repaired by one agent at a time, and not more often
//! than its `ifelapsed` allows. [`LockManager::acquire_lock`] decides both
//! inside the store's critical section and hands back a [`LockOutcome`].
//!
//! Store failures never stop the agent: they are logged and the promise
//! proceeds as if nothing was locked.
//!
//! The manager is driven from a single evaluation thread (`&mut self`). An
//! evaluator that checks promises in parallel has to put it behind a mutex;
//! the per-pass cache and the lock stack are not synchronised on their own.
//!
//! Every caller that mutates lock records of other agents must do so inside
//! the critical section. Processes that bypass it are not excluded.

use super::clock::{Clock, SystemClock};
use super::critical::CriticalSection;
use super::database::LockDatabase;
use super::dates::remove_dates;
use super::fingerprint::{promise_runtime_hash, HashMethod, Promise, Rval};
use super::process::{ProcessControl, SystemProcesses};
use super::purge::{self, PurgeReport};
use super::record::{canonify, LockNames, LockRecord, CRITICAL_SECTION_ID};
use super::stack::LockStack;
use crate::config::LockConfig;
use crate::store::KvStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Scheduling attributes of one promise, in minutes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionContext {
    /// Minimum time between completions; 0 disables the check
    pub if_elapsed: u32,
    /// Time after which a running holder is considered stuck
    pub expire_after: u32,
}

impl TransactionContext {
    pub fn new(if_elapsed: u32, expire_after: u32) -> Self {
        Self {
            if_elapsed,
            expire_after,
        }
    }
}

/// Exclusive right to run one promise, until yielded.
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    names: LockNames,
}

impl LockHandle {
    pub fn lock(&self) -> &str {
        &self.names.lock
    }

    pub fn last(&self) -> &str {
        &self.names.last
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// Locked; run the promise, then yield.
    Proceed(LockHandle),
    /// Do not run: already verified this pass, too soon, or held elsewhere.
    Skip,
    /// Locking is disabled; run without any persistent state.
    Dummy,
}

impl LockOutcome {
    pub fn should_proceed(&self) -> bool {
        !matches!(self, LockOutcome::Skip)
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub critical_section_timeout: Duration,
    pub ignore_locks: bool,
    pub hash_method: HashMethod,
    pub agent_process_names: Vec<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            critical_section_timeout: config.critical_section_timeout(),
            ignore_locks: config.ignore_locks,
            hash_method: config.hash_method,
            agent_process_names: config.agent_process_names.clone(),
        }
    }
}

pub struct LockManager {
    db: LockDatabase,
    clock: Arc<dyn Clock>,
    processes: Arc<dyn ProcessControl>,
    settings: LockSettings,
    stack: LockStack,
    verified: HashSet<String>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, settings: LockSettings) -> Self {
        Self {
            db: LockDatabase::new(store),
            clock: Arc::new(SystemClock),
            processes: Arc::new(SystemProcesses::new()),
            settings,
            stack: LockStack::new(),
            verified: HashSet::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    pub fn database(&self) -> &LockDatabase {
        &self.db
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Number of locks this process currently holds.
    pub fn held(&self) -> usize {
        self.stack.len()
    }

    /// Start a new evaluation pass: promises verified earlier may run again.
    pub fn begin_pass(&mut self) {
        self.verified.clear();
    }

    /// Names of the lock guarding `promise` for `operand` on `host`.
    pub fn lock_names(&self, operand: &str, host: &str, promise: &Promise) -> LockNames {
        let digest = self.fingerprint(operand, promise);
        derive_names(promise, operand, host, &digest)
    }

    fn fingerprint(&self, operand: &str, promise: &Promise) -> String {
        promise_runtime_hash(promise, Some(operand), self.settings.hash_method).to_string()
    }

    /// Try to take the lock for one evaluation of `promise`.
    ///
    /// `now == 0` means the caller has no usable time and always yields
    /// [`LockOutcome::Skip`].
    pub fn acquire_lock(
        &mut self,
        operand: &str,
        host: &str,
        now: i64,
        tc: TransactionContext,
        promise: &Promise,
        ignore_processes: bool,
    ) -> LockOutcome {
        if now == 0 {
            debug!("No valid time given, not locking {}", operand);
            return LockOutcome::Skip;
        }

        let digest = self.fingerprint(operand, promise);
        if !self.verified.insert(digest.clone()) {
            debug!("This promise has already been verified");
            return LockOutcome::Skip;
        }

        if self.settings.ignore_locks {
            return LockOutcome::Dummy;
        }

        let names = derive_names(promise, operand, host, &digest);
        debug!(
            lock = %names.lock,
            expire_after = tc.expire_after,
            if_elapsed = tc.if_elapsed,
            "Acquiring lock"
        );

        if !self.claim(&names, now, tc, ignore_processes) {
            return LockOutcome::Skip;
        }

        self.stack.push(names.clone());
        LockOutcome::Proceed(LockHandle { names })
    }

    /// The read-decide-write sequence. Runs inside the critical section.
    fn claim(
        &self,
        names: &LockNames,
        now: i64,
        tc: TransactionContext,
        ignore_processes: bool,
    ) -> bool {
        let section = CriticalSection::new(
            CRITICAL_SECTION_ID,
            self.settings.critical_section_timeout,
        );
        let pid = self.processes.current_pid();
        let _guard = section.enter(&self.db, self.clock.as_ref(), pid);

        let last_completed = self.find_or_bootstrap(&names.last, now);
        let elapsed = (now - last_completed) / 60;

        if tc.if_elapsed != 0 {
            if elapsed < 0 {
                debug!(
                    "Another agent seems to have done this since I started (elapsed={})",
                    elapsed
                );
                return false;
            }
            if elapsed < tc.if_elapsed as i64 {
                debug!(
                    "Nothing promised here [{:.40}] ({}/{} minutes elapsed)",
                    names.last, elapsed, tc.if_elapsed
                );
                return false;
            }
        }

        if let Some(holder) = self.read_current(&names.lock) {
            if ignore_processes {
                debug!("Couldn't obtain lock for {} (held by {})", names.lock, holder.pid);
                return false;
            }
            if !self.reap_expired(&names.lock, &holder, now, tc) {
                return false;
            }
        }

        let record = LockRecord::new(pid, now, self.processes.start_time(pid));
        if let Err(e) = self.db.write(&names.lock, &record) {
            warn!("Unable to write lock {}: {}", names.lock, e);
        }
        true
    }

    /// Completion time under `last`. A missing record is created so that an
    /// `ifelapsed` longer than the schedule cannot starve the promise forever;
    /// it still reads as "never completed" this time.
    fn find_or_bootstrap(&self, last: &str, now: i64) -> i64 {
        match self.db.find_lock_time(last) {
            Ok(Some(time)) => time,
            Ok(None) => {
                let pid = self.processes.current_pid();
                let record = LockRecord::new(pid, now, self.processes.start_time(pid));
                if let Err(e) = self.db.write(last, &record) {
                    error!("Unable to lock {}: {}", last, e);
                }
                0
            }
            Err(e) => {
                warn!("Unable to read lock {}: {}", last, e);
                0
            }
        }
    }

    fn read_current(&self, lock: &str) -> Option<LockRecord> {
        match self.db.read(lock) {
            Ok(record) => record,
            Err(e) => {
                warn!("Unable to read lock {}, assuming it is free: {}", lock, e);
                None
            }
        }
    }

    /// Deal with a current holder. Returns whether the lock may be taken.
    fn reap_expired(
        &self,
        lock: &str,
        holder: &LockRecord,
        now: i64,
        tc: TransactionContext,
    ) -> bool {
        let elapsed = (now - holder.time) / 60;
        if elapsed < tc.expire_after as i64 {
            debug!("Couldn't obtain lock for {} (already running!)", lock);
            return false;
        }

        info!(
            "Lock {} expired (after {}/{} minutes)",
            lock, elapsed, tc.expire_after
        );

        let pid = holder.pid;
        let terminated = if !self.processes.is_running(pid) {
            debug!("Lock holder {} is no longer running", pid);
            true
        } else if !self
            .processes
            .is_agent_process(pid, &self.settings.agent_process_names)
        {
            info!(
                "PID {} from lock {} is not an agent process, not signalling it",
                pid, lock
            );
            true
        } else {
            self.processes
                .graceful_terminate(pid, holder.process_start_time)
        };

        if terminated {
            info!("Lock expired, process with PID {} killed", pid);
            if let Err(e) = self.db.remove(lock) {
                warn!("Unable to remove expired lock {}: {}", lock, e);
            }
        } else {
            // Taken over regardless; the new record replaces the old one
            error!(
                "Unable to kill expired process {} from lock {} (probably process not found or permission denied)",
                pid, lock
            );
        }
        true
    }

    /// Release a lock taken by [`acquire_lock`](Self::acquire_lock) and
    /// record its completion. Skip and dummy outcomes own nothing.
    pub fn yield_current_lock(&mut self, outcome: LockOutcome) {
        if let LockOutcome::Proceed(handle) = outcome {
            self.release(&handle.names);
        }
    }

    /// Yield, and let the promise be evaluated again within this pass.
    pub fn yield_and_forget(&mut self, outcome: LockOutcome, operand: &str, promise: &Promise) {
        let digest = self.fingerprint(operand, promise);
        self.yield_current_lock(outcome);
        self.verified.remove(&digest);
    }

    fn release(&mut self, names: &LockNames) {
        debug!("Yielding lock '{}'", names.lock);

        if let Err(e) = self.db.remove(&names.lock) {
            debug!("Unable to remove lock {}: {}", names.lock, e);
            return;
        }

        let pid = self.processes.current_pid();
        let record = LockRecord::new(pid, self.clock.now(), self.processes.start_time(pid));
        if let Err(e) = self.db.write(&names.last, &record) {
            error!("Unable to create '{}': {}", names.last, e);
            return;
        }

        self.stack.remove(&names.lock);
    }

    /// Time recorded under a lock name, `None` when absent or unreadable.
    pub fn find_lock_time(&self, name: &str) -> Option<i64> {
        match self.db.find_lock_time(name) {
            Ok(time) => time,
            Err(e) => {
                warn!("Unable to read lock {}: {}", name, e);
                None
            }
        }
    }

    /// Evict lock records past the usage-dependent horizon.
    pub fn purge_locks(&self) -> PurgeReport {
        purge::purge_locks(
            &self.db,
            self.clock.as_ref(),
            self.processes.current_pid(),
            self.settings.critical_section_timeout,
        )
    }

    /// Yield every lock still held. Runs on drop as well.
    pub fn shutdown(&mut self) {
        for names in self.stack.drain_all() {
            self.release(&names);
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            debug!("Releasing {} locks still held at exit", self.stack.len());
            self.shutdown();
        }
    }
}

/// `lock.<bundle>.<type string>-<host>.<operand>_<sum>_<digest>` and its twin.
pub fn derive_names(promise: &Promise, operand: &str, host: &str, digest: &str) -> LockNames {
    let operator = format!("{}-{}", promise.type_string(), host);
    let operand = remove_dates(&canonify(operand));
    LockNames::new(&promise.bundle, &operator, &operand, digest)
}

/// Size budget the classic lock name buffers were built around.
const LOCK_NAME_BUDGET: usize = 4096;

/// Name for a lock that does not belong to a promise:
/// `<type>_<base>_<param><param>...` with each parameter sampled.
pub fn get_lock_name(lock_type: &str, base: &str, params: &[Rval]) -> String {
    let prefix = format!("{}_{}_", lock_type, base);
    let mut name = truncate_bytes(&prefix, LOCK_NAME_BUDGET / 10 - 1).to_string();

    if params.is_empty() {
        return name;
    }
    let sample = LOCK_NAME_BUDGET / (2 * params.len());
    for param in params {
        match param {
            Rval::Scalar(value) => name.push_str(truncate_bytes(value, sample)),
            Rval::FnCall(call) => name.push_str(truncate_bytes(&call.name, sample)),
            // Only scalars and calls take part in lock names
            Rval::List(_) | Rval::Container(_) => {}
        }
    }
    name
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
