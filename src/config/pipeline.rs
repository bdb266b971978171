//! Pipeline file: queue roots, endpoint pool and the ordered stage list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{Endpoint, QueueRoot, StageSpec};

/// Top-level TOML layout.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub pool: Option<PoolSettings>,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageSettings>,
}

/// Where the queues live and how the engine behaves.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub priority_root: PathBuf,
    pub main_root: PathBuf,
    pub log_dir: PathBuf,
    /// Presence of this file stops processing before the next item.
    pub stop_flag: PathBuf,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Metadata key holding the item id.
    #[serde(default = "default_id_key")]
    pub id_key: String,
}

impl PipelineSettings {
    pub fn new(
        priority_root: impl Into<PathBuf>,
        main_root: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        stop_flag: impl Into<PathBuf>,
    ) -> Self {
        Self {
            priority_root: priority_root.into(),
            main_root: main_root.into(),
            log_dir: log_dir.into(),
            stop_flag: stop_flag.into(),
            max_retries: default_max_retries(),
            id_key: default_id_key(),
        }
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn id_key(mut self, key: impl Into<String>) -> Self {
        self.id_key = key.into();
        self
    }

    /// Queue roots in processing order: priority first.
    pub fn roots(&self) -> [QueueRoot; 2] {
        [
            QueueRoot::priority(&self.priority_root),
            QueueRoot::main(&self.main_root),
        ]
    }
}

/// Endpoint pool and acquisition schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    pub lock_dir: PathBuf,
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub check_capability: bool,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// When set, a slot is stale once its record is older than this,
    /// regardless of whether the owner pid exists on this host.
    #[serde(default)]
    pub lease_max_age_secs: Option<u64>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSettings>,
}

impl PoolSettings {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSettings {
    pub url: String,
    pub max_concurrent: u32,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl From<EndpointSettings> for Endpoint {
    fn from(s: EndpointSettings) -> Self {
        let endpoint = Endpoint::new(s.url, s.max_concurrent);
        match s.api_key {
            Some(key) => endpoint.with_api_key(SecretString::from(key)),
            None => endpoint,
        }
    }
}

/// One stage: its directories and the hook that implements it.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSettings {
    pub name: String,
    pub input: String,
    pub output: String,
    pub reject: String,
    pub command: PathBuf,
    /// Capability the stage needs from the endpoint pool, if any.
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StageSettings {
    pub fn spec(&self) -> StageSpec {
        StageSpec::new(&self.name, &self.input, &self.output, &self.reject)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl PipelineConfig {
    /// Read and validate a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad pipeline file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn stage(&self, name: &str) -> Option<&StageSettings> {
        self.stages.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<()> {
        if self.pipeline.id_key.trim().is_empty() {
            return Err(Error::Config("pipeline.id_key must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::Config(format!("duplicate stage name {}", stage.name)));
            }
            for (field, value) in [
                ("input", &stage.input),
                ("output", &stage.output),
                ("reject", &stage.reject),
            ] {
                if value.is_empty() || value.contains('/') || value == "tmp" {
                    return Err(Error::Config(format!(
                        "stage {}: {field} must be a plain directory name, got {value:?}",
                        stage.name
                    )));
                }
            }
            if stage.capability.is_some() && self.pool.is_none() {
                return Err(Error::Config(format!(
                    "stage {} needs capability {:?} but no [pool] is configured",
                    stage.name,
                    stage.capability.as_deref().unwrap_or_default()
                )));
            }
        }

        if let Some(pool) = &self.pool {
            if pool.max_attempts == 0 {
                return Err(Error::Config("pool.max_attempts must be at least 1".to_string()));
            }
            for endpoint in &pool.endpoints {
                if endpoint.url.trim().is_empty() {
                    return Err(Error::Config("pool endpoint with empty url".to_string()));
                }
                if endpoint.max_concurrent == 0 {
                    return Err(Error::Config(format!(
                        "endpoint {}: max_concurrent must be at least 1",
                        endpoint.url
                    )));
                }
            }
        }

        Ok(())
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_id_key() -> String {
    "Item-ID".to_string()
}

fn default_retry_wait_ms() -> u64 {
    2000
}

fn default_retry_jitter_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout_ms() -> u64 {
    5000
}
