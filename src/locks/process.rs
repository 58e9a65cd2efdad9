//! Process inspection and termination of lock holders.
//!
//! Before a stale lock is taken over its holder is terminated. Two guards
//! keep us from hitting an unrelated process that inherited the PID: the
//! holder's command name must look like one of ours, and when the record
//! carries a start time the process is frozen and its start time re-checked
//! before any signal is sent.

use std::time::Duration;

/// Interval between state polls while waiting for a signalled process.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on each wait for a process to stop or exit.
const STOP_WAIT_TIMEOUT: Duration = Duration::from_millis(999);

/// Kernel limit on the length of a process command name.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
    Zombie,
    DoesNotExist,
}

/// Process lifecycle operations the lock engine depends on.
pub trait ProcessControl: Send + Sync {
    fn current_pid(&self) -> u32;

    /// Unix start time of `pid`, `None` when it cannot be determined.
    fn start_time(&self, pid: u32) -> Option<i64>;

    fn is_running(&self, pid: u32) -> bool;

    /// Best-effort check that `pid` is one of `names`. Answers `true` when
    /// the platform gives no way to tell.
    fn is_agent_process(&self, pid: u32, names: &[String]) -> bool;

    /// Interrupt, then terminate, then kill `pid`. Returns whether the
    /// process is gone (or was never the expected one to begin with).
    fn graceful_terminate(&self, pid: u32, start_time: Option<i64>) -> bool;
}

/// The real process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl SystemProcesses {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
mod imp {
    use super::{ProcessState, COMM_LEN, POLL_INTERVAL, STOP_WAIT_TIMEOUT};
    use std::io;
    use std::time::{Duration, Instant};

    pub(super) fn state(pid: u32) -> ProcessState {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => match stat_fields(&stat).and_then(|f| f.first().copied()) {
                Some("T") | Some("t") => ProcessState::Stopped,
                Some("Z") | Some("X") => ProcessState::Zombie,
                _ => ProcessState::Running,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound && proc_mounted() => {
                ProcessState::DoesNotExist
            }
            Err(_) => probe(pid),
        }
    }

    /// Fallback without procfs: existence only.
    fn probe(pid: u32) -> ProcessState {
        // SAFETY: signal 0 only performs the permission and existence check
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) {
            ProcessState::Running
        } else {
            ProcessState::DoesNotExist
        }
    }

    fn proc_mounted() -> bool {
        std::path::Path::new("/proc/self/stat").exists()
    }

    /// Fields after the parenthesised command name, starting at the state.
    fn stat_fields(stat: &str) -> Option<Vec<&str>> {
        let close = stat.rfind(')')?;
        Some(stat[close + 1..].split_whitespace().collect())
    }

    pub(super) fn start_time(pid: u32) -> Option<i64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // Field 22 of stat; the state is field 3
        let ticks: i64 = stat_fields(&stat)?.get(22 - 3)?.parse().ok()?;
        let boot = boot_time()?;
        // SAFETY: sysconf has no preconditions
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz <= 0 {
            return None;
        }
        Some(boot + ticks / hz as i64)
    }

    fn boot_time() -> Option<i64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|v| v.trim().parse().ok())
    }

    pub(super) fn comm(pid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|s| s.trim_end_matches('\n').to_string())
    }

    pub(super) fn comm_matches(comm: &str, name: &str) -> bool {
        let truncated: String = name.chars().take(COMM_LEN).collect();
        comm == truncated
    }

    fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
        // SAFETY: plain kill(2); the pid was checked against our own
        if unsafe { libc::kill(pid as libc::pid_t, sig) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn esrch() -> io::Error {
        io::Error::from_raw_os_error(libc::ESRCH)
    }

    fn wait_until_stopped(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match state(pid) {
                ProcessState::Running => {}
                ProcessState::Stopped => return true,
                ProcessState::Zombie | ProcessState::DoesNotExist => return false,
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        false
    }

    fn wait_until_exited(pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match state(pid) {
                ProcessState::Running => {}
                // Reaping a zombie is its parent's business
                ProcessState::DoesNotExist | ProcessState::Zombie => return true,
                ProcessState::Stopped => return false,
            }
            tracing::debug!("PID {} still alive after signalling, waiting", pid);
            std::thread::sleep(POLL_INTERVAL);
        }
        false
    }

    /// Signal `pid` only if it is still the process that started at `expected`.
    fn safe_kill(pid: u32, expected: i64, sig: libc::c_int) -> io::Result<()> {
        if start_time(pid) != Some(expected) {
            return Err(esrch());
        }

        // Freeze it so it cannot exit and be replaced while we look
        signal(pid, libc::SIGSTOP)?;

        if !wait_until_stopped(pid, STOP_WAIT_TIMEOUT) {
            let _ = signal(pid, libc::SIGCONT);
            return Err(esrch());
        }

        if start_time(pid) != Some(expected) {
            let _ = signal(pid, libc::SIGCONT);
            return Err(esrch());
        }

        let result = signal(pid, sig);
        // May already be gone; nothing useful to do with the outcome
        let _ = signal(pid, libc::SIGCONT);
        result
    }

    fn kill(pid: u32, start: Option<i64>, sig: libc::c_int) -> io::Result<()> {
        match start {
            Some(expected) => safe_kill(pid, expected, sig),
            None => signal(pid, sig),
        }
    }

    fn gone(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::ESRCH)
    }

    pub(super) fn graceful_terminate(pid: u32, start: Option<i64>) -> bool {
        if pid == std::process::id() {
            tracing::warn!("Ignoring request to kill ourself (pid {})", pid);
            return false;
        }

        // A holder that is already gone should not have been signalled at all
        if kill(pid, start, libc::SIGINT).is_err() {
            return false;
        }
        if wait_until_exited(pid, STOP_WAIT_TIMEOUT) {
            return true;
        }

        if let Err(e) = kill(pid, start, libc::SIGTERM) {
            return gone(&e);
        }
        if wait_until_exited(pid, STOP_WAIT_TIMEOUT) {
            return true;
        }

        match kill(pid, start, libc::SIGKILL) {
            Ok(()) => true,
            Err(e) => gone(&e),
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SystemProcesses {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn start_time(&self, pid: u32) -> Option<i64> {
        imp::start_time(pid)
    }

    fn is_running(&self, pid: u32) -> bool {
        matches!(
            imp::state(pid),
            ProcessState::Running | ProcessState::Stopped
        )
    }

    fn is_agent_process(&self, pid: u32, names: &[String]) -> bool {
        match imp::comm(pid) {
            Some(comm) => names.iter().any(|n| imp::comm_matches(&comm, n)),
            None => true,
        }
    }

    fn graceful_terminate(&self, pid: u32, start_time: Option<i64>) -> bool {
        imp::graceful_terminate(pid, start_time)
    }
}

#[cfg(not(unix))]
impl ProcessControl for SystemProcesses {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn start_time(&self, _pid: u32) -> Option<i64> {
        None
    }

    fn is_running(&self, _pid: u32) -> bool {
        true
    }

    fn is_agent_process(&self, _pid: u32, _names: &[String]) -> bool {
        true
    }

    fn graceful_terminate(&self, pid: u32, _start_time: Option<i64>) -> bool {
        tracing::debug!(
            "Graceful termination unsupported here, ignoring holder {}",
            pid
        );
        true
    }
}
