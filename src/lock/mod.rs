//! Advisory slot locks.
//!
//! Each endpoint slot is one file in a shared lock directory. Holding the
//! slot means holding a non-blocking exclusive `flock` on that file; the
//! file body is a JSON [`LockRecord`] naming the holder.
//!
//! Unlinking and locking race: a process can lock an inode that another
//! process has just removed from the directory, while a third creates a
//! fresh file under the same name. To keep at most one holder per path:
//! - holders unlink the path *before* unlocking on release,
//! - acquirers verify after locking that the path still names their inode,
//! - stale records are only unlinked while exclusively locked.

pub mod liveness;
pub mod provider;

pub use liveness::{LeaseExpiry, Liveness, ProcessLiveness, is_pid_alive};
pub use provider::{FileLockProvider, LockProvider, slot_file_name};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::LockRecord;

/// An exclusive lock on one slot file.
#[derive(Debug)]
pub struct SlotLock {
    path: PathBuf,
    tag: String,
    endpoint: String,
    file: Option<File>,
    record: Option<LockRecord>,
}

impl SlotLock {
    pub fn new(path: impl Into<PathBuf>, tag: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            tag: tag.into(),
            endpoint: endpoint.into(),
            file: None,
            record: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// The record written when the lock was taken.
    pub fn record(&self) -> Option<&LockRecord> {
        self.record.as_ref()
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(false)` on contention. A contended file is left exactly
    /// as the holder wrote it.
    pub fn acquire(&mut self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        // The previous holder may have unlinked this inode between our
        // open and our lock.
        if !same_file(&file, &self.path)? {
            debug!(path = %self.path.display(), "slot file replaced while locking");
            return Ok(false);
        }

        let record = LockRecord::for_current_process(&self.tag, &self.endpoint);
        file.set_len(0)?;
        file.write_all(&serde_json::to_vec(&record)?)?;
        file.flush()?;

        debug!(path = %self.path.display(), endpoint = %self.endpoint, "slot lock acquired");
        self.file = Some(file);
        self.record = Some(record);
        Ok(true)
    }

    /// Unlink the slot file and unlock. Safe to call when not held.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        self.record = None;

        let removed = match same_file(&file, &self.path) {
            Ok(true) => match fs::remove_file(&self.path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            Ok(false) => {
                warn!(path = %self.path.display(), "slot file no longer ours at release");
                Ok(())
            }
            Err(e) => Err(e),
        };
        let unlocked = FileExt::unlock(&file);
        drop(file);

        removed?;
        unlocked?;
        debug!(path = %self.path.display(), endpoint = %self.endpoint, "slot lock released");
        Ok(())
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), "releasing slot lock on drop: {e}");
        }
    }
}

/// Whether the record at `path` belongs to an owner that is gone.
///
/// Reads under a shared lock. Returns `false` whenever that is not
/// possible: missing file, file exclusively held, unreadable record.
pub fn is_stale(path: &Path, liveness: &dyn Liveness) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    if FileExt::try_lock_shared(&file).is_err() {
        return false;
    }
    let record = read_record(&file);
    let _ = FileExt::unlock(&file);

    match record {
        Ok(record) => liveness.is_stale(&record),
        Err(_) => false,
    }
}

/// Delete the slot file at `path` if its owner is gone.
///
/// Takes the exclusive lock for the check-and-unlink so that nobody can
/// acquire the slot in between. Returns whether the file was removed.
pub fn reclaim_if_stale(path: &Path, liveness: &dyn Liveness) -> Result<bool> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let stale = same_file(&file, path)?
        && read_record(&file).is_ok_and(|record| liveness.is_stale(&record));
    if stale {
        fs::remove_file(path)?;
    }
    let _ = FileExt::unlock(&file);
    Ok(stale)
}

/// Parse the record stored in an open slot file.
pub fn read_record(mut file: &File) -> Result<LockRecord> {
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(serde_json::from_str(&content)?)
}

pub(crate) fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether `path` still names the inode behind `file`.
pub(crate) fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(path.exists())
    }
}
