//! Lock providers: how the pool turns an (endpoint, slot) pair into a lock.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{Liveness, ProcessLiveness, SlotLock, is_contended, is_stale, read_record, reclaim_if_stale};
use crate::error::Result;
use crate::model::Endpoint;
use crate::telemetry::metrics;

/// Exclusive, non-blocking slot locking.
///
/// The pool never waits on a specific slot: a busy slot is reported as
/// `Ok(None)` and the pool moves on to the next one.
pub trait LockProvider: Send + Sync + 'static {
    type Held: Send + 'static;

    /// Try to take `slot` of `endpoint`, reclaiming it first if its
    /// recorded owner is gone.
    fn try_acquire(&self, endpoint: &Endpoint, slot: u32, tag: &str) -> Result<Option<Self::Held>>;

    /// Give a held slot back. Must tolerate being called twice.
    fn release(&self, held: &mut Self::Held) -> Result<()>;

    /// Remove records owned by this process that nobody currently holds.
    /// Returns how many were removed.
    fn sweep_own(&self) -> Result<usize>;
}

/// Slot files in a directory shared by every cooperating process.
pub struct FileLockProvider {
    lock_dir: PathBuf,
    liveness: Arc<dyn Liveness>,
}

impl FileLockProvider {
    /// Use `lock_dir` (created if missing) with PID-based staleness.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self> {
        let lock_dir = lock_dir.into();
        fs::create_dir_all(&lock_dir)?;
        Ok(Self {
            lock_dir,
            liveness: Arc::new(ProcessLiveness),
        })
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn slot_path(&self, url: &str, slot: u32) -> PathBuf {
        self.lock_dir.join(slot_file_name(url, slot))
    }

    /// Remove every slot file whose owner is gone, whoever it was.
    pub fn reclaim_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.slot_files()? {
            match reclaim_if_stale(&path, self.liveness.as_ref()) {
                Ok(true) => {
                    info!(path = %path.display(), "reclaimed stale slot");
                    metrics::stale_locks_reclaimed().add(1, &[]);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), "stale slot reclaim failed: {e}"),
            }
        }
        Ok(removed)
    }

    fn slot_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            let is_slot_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("server-") && n.ends_with(".lock"));
            if is_slot_file {
                files.push(path);
            }
        }
        Ok(files)
    }
}

impl LockProvider for FileLockProvider {
    type Held = SlotLock;

    fn try_acquire(&self, endpoint: &Endpoint, slot: u32, tag: &str) -> Result<Option<SlotLock>> {
        let path = self.slot_path(&endpoint.url, slot);

        if path.exists() && is_stale(&path, self.liveness.as_ref()) {
            match reclaim_if_stale(&path, self.liveness.as_ref()) {
                Ok(true) => {
                    info!(path = %path.display(), endpoint = %endpoint.url, slot, "reclaimed stale slot");
                    metrics::stale_locks_reclaimed().add(1, &[]);
                }
                Ok(false) => {}
                Err(e) => warn!(path = %path.display(), "stale slot reclaim failed: {e}"),
            }
        }

        let mut lock = SlotLock::new(path, tag, &endpoint.url);
        if lock.acquire()? {
            Ok(Some(lock))
        } else {
            Ok(None)
        }
    }

    fn release(&self, held: &mut SlotLock) -> Result<()> {
        held.release()
    }

    fn sweep_own(&self) -> Result<usize> {
        let me = std::process::id();
        let mut removed = 0;

        for path in self.slot_files()? {
            match remove_if_owned_and_idle(&path, me) {
                Ok(true) => {
                    debug!(path = %path.display(), "swept own slot file");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => debug!(path = %path.display(), "skipping slot file: {e}"),
            }
        }
        Ok(removed)
    }
}

/// Unlink `path` if it records `owner` and is not held.
///
/// The exclusive lock doubles as the "not held" test and keeps the check
/// and the unlink atomic with respect to acquirers.
fn remove_if_owned_and_idle(path: &Path, owner: u32) -> io::Result<bool> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(false),
        Err(e) => return Err(e),
    }
    let owned = super::same_file(&file, path)?
        && read_record(&file).is_ok_and(|record| record.owner_id == owner);
    if owned {
        fs::remove_file(path)?;
    }
    let _ = FileExt::unlock(&file);
    Ok(owned)
}

/// `server-<8 hex of sha256(url)>-<slot>.lock`
pub fn slot_file_name(url: &str, slot: u32) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let short: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("server-{short}-{slot}.lock")
}
