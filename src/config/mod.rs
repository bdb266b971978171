//! Typed configuration.
//!
//! Process-level settings come from environment variables and are loaded
//! once at startup. The pipeline layout, endpoint pool and stage list come
//! from a TOML file named by `STAGEPIPE_CONFIG`.

pub mod pipeline;
pub mod secrets;

pub use pipeline::{EndpointSettings, PipelineConfig, PipelineSettings, PoolSettings, StageSettings};

use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub pipeline_file: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            pipeline_file: PathBuf::from(required_var("STAGEPIPE_CONFIG")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
