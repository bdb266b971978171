//! Stage processing engine: claim, invoke, retry, relocate.
//!
//! A [`StageProcessor`] drains one stage's input directory under each queue
//! root. A [`Pipeline`] runs an ordered list of processors, each one over
//! the priority root and then the main root.

pub mod pipeline;
pub mod processor;
pub mod status;

pub use pipeline::Pipeline;
pub use processor::{PROCESSING_MARKER, RunReport, StageProcessor, claim, list_queued};
pub use status::{StageStatus, snapshot};

use std::future::Future;

use crate::error::Result;
use crate::model::{StageInput, Verdict};

/// One processing step, invoked once per attempt on a claimed item.
///
/// Must tolerate being called again for the same item after a failed
/// attempt. An `Err` is treated exactly like [`Verdict::Reject`] with the
/// error text as the reason.
pub trait Stage: Send + Sync {
    fn process(&self, input: StageInput) -> impl Future<Output = Result<Verdict>> + Send;
}

impl<F, Fut> Stage for F
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Verdict>> + Send,
{
    fn process(&self, input: StageInput) -> impl Future<Output = Result<Verdict>> + Send {
        self(input)
    }
}
