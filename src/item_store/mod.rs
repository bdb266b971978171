//! Item files on disk.
//!
//! Format: zero or more `Key: Value` lines, one blank line, then the body.
//! Every mutation that another process could observe goes through
//! [`atomic_write`] or [`atomic_move`], which stage their bytes in a `tmp/`
//! directory on the same volume and rename into place.

pub mod fsync;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Item, Metadata};

/// Name of the staging / in-flight subdirectory of every stage directory.
pub const TMP_DIR: &str = "tmp";

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Read and parse an item file.
///
/// Bytes that are not valid UTF-8 are decoded as ISO-8859-1, which accepts
/// any byte sequence.
pub fn parse(path: &Path) -> Result<Item> {
    let bytes = fs::read(path)?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            debug!(path = %path.display(), "not utf-8, decoding as latin-1");
            e.into_bytes().iter().map(|&b| char::from(b)).collect()
        }
    };
    Ok(parse_str(&text))
}

/// Parse item text.
///
/// Leading lines of the form `Key: Value` are metadata. The header block
/// ends at the first blank line or the first line without a colon; such a
/// line starts the body. Blank lines before the first body line and after
/// the last one are dropped.
///
/// Keys and values are trimmed, so a value with surrounding spaces and a
/// body with leading blank lines do not survive a `render`/`parse_str`
/// round trip byte for byte.
pub fn parse_str(text: &str) -> Item {
    let mut metadata = Metadata::new();
    let mut body: Vec<&str> = Vec::new();
    let mut in_header = true;

    for line in text.lines() {
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            in_header = false;
            if !body.is_empty() {
                body.push(line);
            }
            continue;
        }

        if in_header {
            if let Some((key, value)) = line.split_once(':') {
                metadata.insert(key.trim(), value.trim());
                continue;
            }
            in_header = false;
        }
        body.push(line);
    }

    let body = body.join("\n").trim_end_matches('\n').to_string();
    Item { metadata, body }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Render an item: metadata lines in order, a blank line, the body with
/// exactly one trailing newline.
///
/// Line breaks inside metadata values are flattened to spaces; a raw
/// newline there would end the header block on the next read.
pub fn render(item: &Item) -> String {
    let mut out = String::new();
    for (key, value) in item.metadata.iter() {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&single_line(value));
        out.push('\n');
    }
    out.push('\n');

    let body = item.body.trim_end_matches(['\n', '\r']);
    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
    out
}

/// Replace CR and LF with spaces.
pub fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Write an item in place (not atomic).
pub fn write(path: &Path, item: &Item) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(render(item).as_bytes())?;
    Ok(())
}

/// Staging directory for a file living in `dir`.
///
/// Files already inside a `tmp/` directory stage next to themselves rather
/// than in a nested `tmp/tmp/`.
pub fn staging_dir(dir: &Path) -> PathBuf {
    if dir.file_name().is_some_and(|n| n == TMP_DIR) {
        dir.to_path_buf()
    } else {
        dir.join(TMP_DIR)
    }
}

fn staging_name(name: &str) -> String {
    format!(".{name}.{}.partial", Uuid::new_v4())
}

/// Write `item` to `path` so readers see either the old or the new file,
/// never a partial one.
pub fn atomic_write(path: &Path, item: &Item) -> Result<()> {
    let dir = parent_of(path)?;
    let name = name_of(path)?;
    let stage_dir = staging_dir(dir);
    fs::create_dir_all(&stage_dir)?;

    let staged = stage_dir.join(staging_name(&name));
    let result = (|| -> Result<()> {
        let mut file = File::create(&staged)?;
        file.write_all(render(item).as_bytes())?;
        fsync::fsync_file(&file)?;
        fs::rename(&staged, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staged);
        return result;
    }

    if let Err(e) = fsync::fsync_dir(dir) {
        warn!(dir = %dir.display(), "directory fsync failed: {e}");
    }
    Ok(())
}

/// Move `source` into `dest_dir`, keeping its file name.
///
/// The copy is staged in `dest_dir/tmp/`, renamed into place, and only
/// then is the source removed. A crash at any point leaves at least one
/// complete copy; a crash between rename and removal leaves two, and the
/// source may then be deleted by a supervisor.
pub fn atomic_move(source: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = name_of(source)?;
    let stage_dir = dest_dir.join(TMP_DIR);
    fs::create_dir_all(&stage_dir).map_err(|e| relocation(source, e))?;

    let staged = stage_dir.join(staging_name(&name));
    let dest = dest_dir.join(&name);

    let placed = fs::copy(source, &staged)
        .and_then(|_| fsync::fsync_path(&staged))
        .and_then(|_| fs::rename(&staged, &dest));
    if let Err(e) = placed {
        let _ = fs::remove_file(&staged);
        return Err(relocation(source, e));
    }

    if let Err(e) = fsync::fsync_dir(dest_dir) {
        warn!(dir = %dest_dir.display(), "directory fsync failed: {e}");
    }

    if let Err(e) = fs::remove_file(source) {
        error!(
            source = %source.display(),
            dest = %dest.display(),
            "item placed but source not removed, duplicate left behind: {e}"
        );
        return Err(relocation(source, e));
    }
    debug!(from = %source.display(), to = %dest.display(), "moved item");
    Ok(dest)
}

/// Remove a file, ignoring "not found".
pub fn safe_remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn relocation(path: &Path, source: std::io::Error) -> Error {
    Error::Relocation {
        path: path.to_path_buf(),
        source,
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))
}

fn name_of(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Other(format!("{} has no file name", path.display())))
}
