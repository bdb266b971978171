//! One stage over one or more queue roots.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use super::Stage;
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::item_store::{self, TMP_DIR};
use crate::model::{
    Item, ItemState, PIPELINE_STAGE, QueueRoot, REJECTION_REASON, StageInput, StageSpec, Verdict,
    file_name_of,
};
use crate::telemetry::item::{record_attempts, record_transition, start_item_span};
use crate::telemetry::metrics;

/// Name of the marker file written into a stage's `tmp/` while an item is
/// being processed there. Its content is the item id.
pub const PROCESSING_MARKER: &str = "PROCESSING";

/// Counts from one or more stage runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub advanced: usize,
    pub rejected: usize,
    /// Items that could not be moved into `tmp/`; they stay queued.
    pub claim_failures: usize,
    /// Items whose terminal write or move failed; they stay claimed.
    pub relocation_failures: usize,
    /// The stop flag was seen.
    pub stopped: bool,
}

impl RunReport {
    pub fn merge(&mut self, other: RunReport) {
        self.advanced += other.advanced;
        self.rejected += other.rejected;
        self.claim_failures += other.claim_failures;
        self.relocation_failures += other.relocation_failures;
        self.stopped |= other.stopped;
    }

    /// No item was left behind by an error.
    pub fn is_clean(&self) -> bool {
        self.claim_failures == 0 && self.relocation_failures == 0
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Advanced => self.advanced += 1,
            Outcome::Rejected => self.rejected += 1,
            Outcome::ClaimFailed => self.claim_failures += 1,
            Outcome::RelocationFailed => self.relocation_failures += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Advanced,
    Rejected,
    ClaimFailed,
    RelocationFailed,
}

/// Drains a stage's input directory, one item at a time.
pub struct StageProcessor<S> {
    spec: StageSpec,
    settings: Arc<PipelineSettings>,
    stage: S,
}

impl<S: Stage> StageProcessor<S> {
    pub fn new(spec: StageSpec, settings: Arc<PipelineSettings>, stage: S) -> Self {
        Self {
            spec,
            settings,
            stage,
        }
    }

    pub fn spec(&self) -> &StageSpec {
        &self.spec
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Process every root in order. A root is drained completely before
    /// the next one starts.
    pub async fn run(&self, roots: &[QueueRoot]) -> RunReport {
        let mut report = RunReport::default();
        for root in roots {
            report.merge(self.run_root(root).await);
        }
        report
    }

    /// Process the stage's input directory under one root, oldest first.
    pub async fn run_root(&self, root: &QueueRoot) -> RunReport {
        let mut report = RunReport::default();
        let input_dir = root.dir(&self.spec.input);

        let queued = match list_queued(&input_dir) {
            Ok(queued) => queued,
            Err(e) => {
                warn!(
                    stage = %self.spec.name,
                    root = %root.label,
                    dir = %input_dir.display(),
                    "cannot list input directory: {e}"
                );
                return report;
            }
        };

        info!(
            stage = %self.spec.name,
            root = %root.label,
            queued = queued.len(),
            "stage started"
        );

        for path in queued {
            if self.settings.stop_flag.exists() {
                warn!(
                    stage = %self.spec.name,
                    root = %root.label,
                    flag = %self.settings.stop_flag.display(),
                    "stop flag present, leaving remaining items queued"
                );
                report.stopped = true;
                break;
            }
            report.record(self.process_item(root, &path).await);
        }

        info!(
            stage = %self.spec.name,
            root = %root.label,
            advanced = report.advanced,
            rejected = report.rejected,
            claim_failures = report.claim_failures,
            relocation_failures = report.relocation_failures,
            "stage finished"
        );
        report
    }

    async fn process_item(&self, root: &QueueRoot, source: &Path) -> Outcome {
        let labels = [
            KeyValue::new("stage", self.spec.name.clone()),
            KeyValue::new("root", root.label.clone()),
        ];
        let tmp_dir = root.dir(&self.spec.input).join(TMP_DIR);

        let claimed = match claim(source, &tmp_dir) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(
                    stage = %self.spec.name,
                    path = %source.display(),
                    "claim failed, skipping item: {e}"
                );
                metrics::item_failures().add(
                    1,
                    &[
                        KeyValue::new("stage", self.spec.name.clone()),
                        KeyValue::new("phase", "claim"),
                    ],
                );
                return Outcome::ClaimFailed;
            }
        };
        metrics::items_claimed().add(1, &labels);

        let id = match item_store::parse(&claimed) {
            Ok(item) => item.id_or_file_name(&self.settings.id_key, &claimed),
            Err(_) => file_name_of(&claimed),
        };
        let span = start_item_span(&self.spec.name, &root.label, &id);
        record_transition(&span, ItemState::Queued, ItemState::Claimed);

        let _marker = ProcessingMarker::write(&tmp_dir, &id);

        let (decision, attempts) = self.attempt(&id, &claimed).instrument(span.clone()).await;
        record_attempts(&span, attempts);

        span.in_scope(|| match decision {
            Decision::Advance(item) => match self.relocate_success(root, &claimed, item) {
                Ok(dest) => {
                    record_transition(&span, ItemState::Claimed, ItemState::Advanced);
                    metrics::items_advanced().add(1, &labels);
                    info!(item_id = %id, attempts, dest = %dest.display(), "item advanced");
                    Outcome::Advanced
                }
                Err(e) => self.relocation_failed(&id, &claimed, e),
            },
            Decision::Reject(reason) => match self.relocate_reject(root, &claimed, &id, &reason) {
                Ok(dest) => {
                    record_transition(&span, ItemState::Claimed, ItemState::Rejected);
                    metrics::items_rejected().add(1, &labels);
                    error!(item_id = %id, attempts, dest = %dest.display(), reason = %reason, "item rejected");
                    Outcome::Rejected
                }
                Err(e) => self.relocation_failed(&id, &claimed, e),
            },
        })
    }

    /// Invoke the stage up to `max_retries + 1` times.
    async fn attempt(&self, id: &str, claimed: &Path) -> (Decision, u32) {
        let total = self.settings.max_retries.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=total {
            let (result, reason) = match self.attempt_once(id, claimed).await {
                Ok(Verdict::Advance { metadata, body }) => {
                    self.count_attempt("advance");
                    return (Decision::Advance(Item::new(metadata, body)), attempt);
                }
                Ok(Verdict::Reject { reason }) => ("reject", reason),
                Err(e) => ("error", e.to_string()),
            };
            self.count_attempt(result);

            if attempt < total {
                warn!(item_id = %id, attempt, total, reason = %reason, "attempt failed, retrying");
            } else {
                debug!(item_id = %id, attempt, reason = %reason, "final attempt failed");
            }
            last_reason = reason;
        }

        (Decision::Reject(last_reason), total)
    }

    async fn attempt_once(&self, id: &str, claimed: &Path) -> Result<Verdict> {
        let item = item_store::parse(claimed)?;
        let input = StageInput {
            id: id.to_string(),
            path: claimed.to_path_buf(),
            metadata: item.metadata,
            body: item.body,
        };
        self.stage.process(input).await
    }

    fn count_attempt(&self, result: &'static str) {
        metrics::stage_attempts().add(
            1,
            &[
                KeyValue::new("stage", self.spec.name.clone()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn relocate_success(&self, root: &QueueRoot, claimed: &Path, mut item: Item) -> Result<PathBuf> {
        item.metadata.insert(PIPELINE_STAGE, self.spec.output.as_str());
        item_store::atomic_write(claimed, &item)?;
        item_store::atomic_move(claimed, &root.dir(&self.spec.output))
    }

    fn relocate_reject(&self, root: &QueueRoot, claimed: &Path, id: &str, reason: &str) -> Result<PathBuf> {
        let mut item = item_store::parse(claimed)?;
        item.metadata.insert(PIPELINE_STAGE, self.spec.reject.as_str());
        item.metadata.insert(REJECTION_REASON, item_store::single_line(reason));
        item_store::atomic_write(claimed, &item)?;
        let dest = item_store::atomic_move(claimed, &root.dir(&self.spec.reject))?;

        if let Err(e) = self.append_audit(root, id, reason) {
            warn!(item_id = %id, "writing rejection log failed: {e}");
        }
        Ok(dest)
    }

    /// `<log_dir>/<root>_<reject suffix>.log`, one `<id> <reason>` line per rejection.
    pub fn audit_log_path(&self, root: &QueueRoot) -> PathBuf {
        self.settings
            .log_dir
            .join(format!("{}_{}.log", root.label, self.spec.reject_suffix()))
    }

    fn append_audit(&self, root: &QueueRoot, id: &str, reason: &str) -> io::Result<()> {
        fs::create_dir_all(&self.settings.log_dir)?;
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_log_path(root))?;
        writeln!(log, "{id} {}", item_store::single_line(reason))
    }

    fn relocation_failed(&self, id: &str, claimed: &Path, e: crate::error::Error) -> Outcome {
        error!(
            item_id = %id,
            path = %claimed.display(),
            "relocation failed, item left claimed: {e}"
        );
        metrics::item_failures().add(
            1,
            &[
                KeyValue::new("stage", self.spec.name.clone()),
                KeyValue::new("phase", "relocate"),
            ],
        );
        Outcome::RelocationFailed
    }
}

enum Decision {
    Advance(Item),
    Reject(String),
}

/// Removes the processing marker when dropped.
struct ProcessingMarker {
    path: PathBuf,
}

impl ProcessingMarker {
    fn write(tmp_dir: &Path, id: &str) -> Self {
        let path = tmp_dir.join(PROCESSING_MARKER);
        if let Err(e) = fs::write(&path, id) {
            warn!(path = %path.display(), "writing processing marker failed: {e}");
        }
        Self { path }
    }
}

impl Drop for ProcessingMarker {
    fn drop(&mut self) {
        if let Err(e) = item_store::safe_remove(&self.path) {
            warn!(path = %self.path.display(), "removing processing marker failed: {e}");
        }
    }
}

/// Move `source` into `tmp_dir` by rename.
///
/// Of several processes claiming the same file, exactly one succeeds; the
/// others get `NotFound`.
pub fn claim(source: &Path, tmp_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(tmp_dir)?;
    let name = source
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "item path has no file name"))?;
    if name == PROCESSING_MARKER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("item name collides with the {PROCESSING_MARKER} marker"),
        )
        .into());
    }
    let claimed = tmp_dir.join(name);
    fs::rename(source, &claimed)?;
    debug!(from = %source.display(), to = %claimed.display(), "claimed item");
    Ok(claimed)
}

/// Regular files directly in `dir`, oldest modification first.
///
/// Skips dotfiles and subdirectories (including `tmp/`). A file named
/// like the processing marker is left in place with a warning, since
/// claiming it would let the marker overwrite it. A missing directory
/// holds no items.
pub fn list_queued(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut queued: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if name == TMP_DIR || name.to_string_lossy().starts_with('.') {
            continue;
        }
        if name == PROCESSING_MARKER {
            warn!(path = %entry.path().display(), "file named like the processing marker, not queued");
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        queued.push((mtime, entry.path()));
    }

    queued.sort();
    Ok(queued.into_iter().map(|(_, path)| path).collect())
}
