//! fsync helpers for the atomic write and move paths.
//!
//! A rename is only durable once the directory holding the new entry has
//! been synced; the file contents must be synced before the rename.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Sync a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Sync a path that was written by someone else (e.g. `fs::copy`).
pub fn fsync_path(path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(path)?.sync_all()
}

/// Sync a directory so that entries created or renamed in it persist.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir)?.sync_all()
}
