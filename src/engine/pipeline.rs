//! Ordered sequence of stages sharing one set of queue roots.

use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use super::Stage;
use super::processor::{RunReport, StageProcessor};
use super::status::{StageStatus, snapshot};
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::item_store::TMP_DIR;
use crate::model::{QueueRoot, StageSpec};

/// Stages in run order. Each stage drains the priority root and then the
/// main root before the next stage starts.
pub struct Pipeline<S> {
    settings: Arc<PipelineSettings>,
    processors: Vec<StageProcessor<S>>,
}

impl<S: Stage> Pipeline<S> {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            processors: Vec::new(),
        }
    }

    /// Append a stage.
    pub fn stage(mut self, spec: StageSpec, stage: S) -> Self {
        self.processors
            .push(StageProcessor::new(spec, Arc::clone(&self.settings), stage));
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn processors(&self) -> &[StageProcessor<S>] {
        &self.processors
    }

    pub fn specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.processors.iter().map(|p| p.spec())
    }

    /// Create every stage directory and its `tmp/` under both roots, plus
    /// the log directory. Safe to call repeatedly.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.settings.log_dir)?;
        for root in self.settings.roots() {
            for spec in self.specs() {
                for dir in [&spec.input, &spec.output, &spec.reject] {
                    fs::create_dir_all(root.dir(dir).join(TMP_DIR))?;
                }
            }
        }
        Ok(())
    }

    /// Run every stage, or only `only` when given, over `roots`.
    ///
    /// Stops early once the stop flag has been seen.
    pub async fn run(&self, roots: &[QueueRoot], only: Option<&str>) -> RunReport {
        let mut report = RunReport::default();
        for processor in &self.processors {
            if only.is_some_and(|name| name != processor.spec().name) {
                continue;
            }
            report.merge(processor.run(roots).await);
            if report.stopped {
                warn!(stage = %processor.spec().name, "pipeline stopped by stop flag");
                break;
            }
        }
        info!(
            advanced = report.advanced,
            rejected = report.rejected,
            claim_failures = report.claim_failures,
            relocation_failures = report.relocation_failures,
            stopped = report.stopped,
            "pipeline run finished"
        );
        report
    }

    pub fn status(&self) -> Result<Vec<StageStatus>> {
        let specs: Vec<StageSpec> = self.specs().cloned().collect();
        snapshot(&self.settings.roots(), &specs)
    }
}
