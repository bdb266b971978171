//! Point-in-time view of the queues.

use std::fs;
use std::path::Path;

use serde::Serialize;

use super::processor::{PROCESSING_MARKER, list_queued};
use crate::error::Result;
use crate::item_store::TMP_DIR;
use crate::model::{QueueRoot, StageSpec};

/// Counts for one stage under one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub root: String,
    pub stage: String,
    pub queued: usize,
    /// Items claimed into `tmp/`, including ones left behind by a crash.
    pub in_flight: usize,
    pub rejected: usize,
    /// Id of the item currently being processed, from the marker file.
    pub processing: Option<String>,
}

/// Count items for every stage under every root.
pub fn snapshot(roots: &[QueueRoot], stages: &[StageSpec]) -> Result<Vec<StageStatus>> {
    let mut out = Vec::with_capacity(roots.len() * stages.len());
    for root in roots {
        for spec in stages {
            let input = root.dir(&spec.input);
            let tmp = input.join(TMP_DIR);
            out.push(StageStatus {
                root: root.label.clone(),
                stage: spec.name.clone(),
                queued: list_queued(&input)?.len(),
                in_flight: count_claimed(&tmp)?,
                rejected: list_queued(&root.dir(&spec.reject))?.len(),
                processing: read_marker(&tmp),
            });
        }
    }
    Ok(out)
}

fn count_claimed(tmp: &Path) -> Result<usize> {
    Ok(list_queued(tmp)?
        .iter()
        .filter(|p| p.file_name().is_some_and(|n| n != PROCESSING_MARKER))
        .count())
}

fn read_marker(tmp: &Path) -> Option<String> {
    let id = fs::read_to_string(tmp.join(PROCESSING_MARKER)).ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}
