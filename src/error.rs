//! Error types for stagepipe.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock record error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed item file {path}: {reason}")]
    ItemFormat { path: PathBuf, reason: String },

    /// A stage callback failed. Counts as one attempt in the retry loop.
    #[error("stage {stage} failed: {reason}")]
    Stage { stage: String, reason: String },

    /// Writing or moving an item after its terminal decision failed.
    /// The item stays claimed in the stage's `tmp/` for recovery.
    #[error("relocating {path} failed: {source}")]
    Relocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn stage(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
