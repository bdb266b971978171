//! Deciding whether a lock record's owner is gone.
//!
//! PID probing only means something when every owner shares this host's
//! process namespace. Pools whose lock directory is shared across hosts
//! should use [`LeaseExpiry`] instead.

use std::io;
use std::time::Duration;

use chrono::Utc;

use crate::model::LockRecord;

/// Judges a lock record that is not currently held.
///
/// Implementations must lean towards `false`: calling a live owner's
/// record stale breaks mutual exclusion, while a missed stale record only
/// costs a retry.
pub trait Liveness: Send + Sync {
    fn is_stale(&self, record: &LockRecord) -> bool;
}

/// Stale when the owner pid no longer exists on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_stale(&self, record: &LockRecord) -> bool {
        !is_pid_alive(record.owner_id)
    }
}

/// Stale once the record is older than `max_age`.
#[derive(Debug, Clone, Copy)]
pub struct LeaseExpiry {
    pub max_age: Duration,
}

impl LeaseExpiry {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl Liveness for LeaseExpiry {
    fn is_stale(&self, record: &LockRecord) -> bool {
        let Ok(max_age) = chrono::Duration::from_std(self.max_age) else {
            return false;
        };
        Utc::now().signed_duration_since(record.acquired_at) > max_age
    }
}

/// Check whether a pid exists, via `kill(pid, 0)`.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs the existence and permission checks
        // without delivering anything. `pid` is a positive i32.
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        // EPERM: exists, owned by someone else.
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
