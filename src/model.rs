//! Core data model.
//!
//! A work item is a text file: ordered `Key: Value` metadata lines, a blank
//! separator, then a free-text body. It moves between stage directories and
//! its metadata grows as each stage annotates it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Metadata key naming the directory an item was last relocated to.
pub const PIPELINE_STAGE: &str = "Pipeline-Stage";

/// Metadata key carrying the failure text of a rejected item.
pub const REJECTION_REASON: &str = "Rejection-Reason";

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Ordered string-to-string map.
///
/// Keys keep the position of their first insertion, so rewriting a field
/// does not reorder the header block on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Insert or replace a value. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// The parsed content of one item file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub metadata: Metadata,
    pub body: String,
}

impl Item {
    pub fn new(metadata: Metadata, body: impl Into<String>) -> Self {
        Self {
            metadata,
            body: body.into(),
        }
    }

    /// Resolve the item's id: the value under `id_key`, else the file name.
    pub fn id_or_file_name(&self, id_key: &str, path: &Path) -> String {
        match self.metadata.get(id_key) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => file_name_of(path),
        }
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Item state
// ---------------------------------------------------------------------------

/// Where an item sits relative to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Waiting in the stage's input directory.
    Queued,
    /// Renamed into the stage's `tmp/` by exactly one processor.
    Claimed,
    /// Relocated to the next stage's input directory. Terminal for this stage.
    Advanced,
    /// Relocated to the reject directory with a reason. Terminal.
    Rejected,
}

impl ItemState {
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Queued, Claimed) | (Claimed, Advanced) | (Claimed, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Advanced | ItemState::Rejected)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Queued => "queued",
            ItemState::Claimed => "claimed",
            ItemState::Advanced => "advanced",
            ItemState::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Stage layout
// ---------------------------------------------------------------------------

/// Directory names for one stage, relative to a queue root.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub input: String,
    pub output: String,
    pub reject: String,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        reject: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            reject: reject.into(),
        }
    }

    /// Reject directory name without its ordering prefix:
    /// `51_rejected_duplicate` becomes `rejected_duplicate`.
    pub fn reject_suffix(&self) -> &str {
        match self.reject.split_once('_') {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => &self.reject,
        }
    }
}

/// One independent tree of stage directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRoot {
    /// Short label used in audit log names (`pri`, `main`).
    pub label: String,
    pub path: PathBuf,
}

impl QueueRoot {
    pub fn priority(path: impl Into<PathBuf>) -> Self {
        Self {
            label: "pri".to_string(),
            path: path.into(),
        }
    }

    pub fn main(path: impl Into<PathBuf>) -> Self {
        Self {
            label: "main".to_string(),
            path: path.into(),
        }
    }

    pub fn dir(&self, stage_dir: &str) -> PathBuf {
        self.path.join(stage_dir)
    }
}

// ---------------------------------------------------------------------------
// Stage callback contract
// ---------------------------------------------------------------------------

/// What a stage callback receives for one attempt.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub id: String,
    /// Claimed path inside the stage's `tmp/`.
    pub path: PathBuf,
    pub metadata: Metadata,
    pub body: String,
}

/// A stage callback's decision for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Move on to the next stage with (possibly rewritten) content.
    Advance { metadata: Metadata, body: String },
    /// Fail this attempt. After the last attempt the reason is recorded.
    Reject { reason: String },
}

impl Verdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        Verdict::Reject {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoints and locks
// ---------------------------------------------------------------------------

/// A remote compute endpoint with a fixed number of concurrent slots.
#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    pub max_concurrent: u32,
    pub api_key: Option<SecretString>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            url: url.into(),
            max_concurrent,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }
}

/// Ownership record written into a held slot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Process id of the holder.
    pub owner_id: u32,
    pub acquired_at: DateTime<Utc>,
    /// Who asked for the slot (usually a stage name).
    pub tag: String,
    pub endpoint: String,
}

impl LockRecord {
    pub fn for_current_process(tag: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            owner_id: std::process::id(),
            acquired_at: Utc::now(),
            tag: tag.into(),
            endpoint: endpoint.into(),
        }
    }
}
