//! Stages implemented by external executables.
//!
//! The hook runs once per attempt with the claimed item's location in its
//! environment:
//!
//! | Variable | Value |
//! |---|---|
//! | `STAGEPIPE_ITEM_PATH` | claimed item file (read it, do not move it) |
//! | `STAGEPIPE_ITEM_ID` | item id |
//! | `STAGEPIPE_STAGE` | stage name |
//! | `STAGEPIPE_OUTPUT` | where to write the rewritten item, if any |
//! | `STAGEPIPE_ENDPOINT` | leased endpoint URL (capability stages only) |
//! | `STAGEPIPE_ENDPOINT_API_KEY` | that endpoint's key, when configured |
//!
//! Exit 0 advances the item, using the file at `STAGEPIPE_OUTPUT` as its
//! new content when the hook wrote one. Any other exit rejects the attempt
//! with the last non-empty stderr line.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StageSettings;
use crate::config::secrets::ExposeSecret;
use crate::engine::Stage;
use crate::error::{Error, Result};
use crate::item_store;
use crate::lock::{FileLockProvider, LockProvider};
use crate::model::{StageInput, Verdict};
use crate::pool::{Lease, ResourcePool};

/// A [`Stage`] that runs a command, optionally while holding an endpoint
/// slot from the pool.
pub struct CommandStage<L: LockProvider = FileLockProvider> {
    name: String,
    command: PathBuf,
    capability: Option<String>,
    timeout: Option<Duration>,
    pool: Option<ResourcePool<L>>,
}

impl CommandStage<FileLockProvider> {
    pub fn from_settings(settings: &StageSettings, pool: Option<ResourcePool>) -> Self {
        Self {
            name: settings.name.clone(),
            command: settings.command.clone(),
            capability: settings.capability.clone(),
            timeout: settings.timeout(),
            pool,
        }
    }
}

impl<L: LockProvider> CommandStage<L> {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            capability: None,
            timeout: None,
            pool: None,
        }
    }

    /// Hold a slot on an endpoint advertising `capability` for every run.
    pub fn with_pool(mut self, pool: ResourcePool<L>, capability: impl Into<String>) -> Self {
        self.pool = Some(pool);
        self.capability = Some(capability.into());
        self
    }

    /// Kill the hook if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: StageInput) -> Result<Verdict> {
        let lease = match self.lease().await? {
            Leased::NotNeeded => None,
            Leased::Held(lease) => Some(lease),
            Leased::Unavailable(reason) => return Ok(Verdict::reject(reason)),
        };

        let output = OutputFile::beside(&input.path);
        let start = Instant::now();
        let result = self.run_hook(&input, output.path(), lease.as_ref()).await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        drop(lease);

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                warn!(stage = %self.name, item_id = %input.id, duration_ms, error = %e, "hook failed");
                return Err(e);
            }
        };

        if !status.success {
            let reason = status.reason();
            info!(stage = %self.name, item_id = %input.id, duration_ms, reason = %reason, "hook rejected item");
            return Ok(Verdict::Reject { reason });
        }

        debug!(stage = %self.name, item_id = %input.id, duration_ms, "hook completed");
        if output.path().exists() {
            let item = item_store::parse(output.path())?;
            Ok(Verdict::Advance {
                metadata: item.metadata,
                body: item.body,
            })
        } else {
            Ok(Verdict::Advance {
                metadata: input.metadata,
                body: input.body,
            })
        }
    }

    async fn lease(&self) -> Result<Leased<L>> {
        let Some(capability) = self.capability.as_deref() else {
            return Ok(Leased::NotNeeded);
        };
        let Some(pool) = &self.pool else {
            return Err(Error::stage(
                &self.name,
                format!("needs capability {capability} but has no endpoint pool"),
            ));
        };
        Ok(match pool.acquire(Some(capability), &self.name).await {
            Some(lease) => Leased::Held(lease),
            None => Leased::Unavailable(format!("no endpoint available for {capability}")),
        })
    }

    async fn run_hook(&self, input: &StageInput, output: &Path, lease: Option<&Lease<L>>) -> Result<HookStatus> {
        // Relative commands resolve against the process CWD, not the item's directory.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        debug!(
            stage = %self.name,
            item_id = %input.id,
            command = %command.display(),
            endpoint = lease.map(|l| l.url()).unwrap_or("-"),
            "running hook"
        );

        let mut cmd = Command::new(&command);
        cmd.env("STAGEPIPE_ITEM_PATH", &input.path)
            .env("STAGEPIPE_ITEM_ID", &input.id)
            .env("STAGEPIPE_STAGE", &self.name)
            .env("STAGEPIPE_OUTPUT", output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(lease) = lease {
            cmd.env("STAGEPIPE_ENDPOINT", lease.url());
            if let Some(key) = &lease.endpoint().api_key {
                cmd.env("STAGEPIPE_ENDPOINT_API_KEY", key.expose_secret());
            }
        }

        let child = cmd.spawn()?;
        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(waited) => waited,
                Err(_) => {
                    return Err(Error::stage(
                        &self.name,
                        format!("hook timed out after {limit:?}"),
                    ));
                }
            },
            None => child.wait_with_output().await,
        }?;

        if !waited.stdout.is_empty() {
            debug!(stage = %self.name, item_id = %input.id, "hook stdout: {}", String::from_utf8_lossy(&waited.stdout).trim_end());
        }

        Ok(HookStatus {
            success: waited.status.success(),
            code: waited.status.code(),
            stderr: String::from_utf8_lossy(&waited.stderr).into_owned(),
        })
    }
}

impl<L: LockProvider> Stage for CommandStage<L> {
    fn process(&self, input: StageInput) -> impl Future<Output = Result<Verdict>> + Send {
        self.run(input)
    }
}

enum Leased<L: LockProvider> {
    NotNeeded,
    Held(Lease<L>),
    Unavailable(String),
}

struct HookStatus {
    success: bool,
    code: Option<i32>,
    stderr: String,
}

impl HookStatus {
    fn reason(&self) -> String {
        let last = self.stderr.lines().map(str::trim).rfind(|l| !l.is_empty());
        match (last, self.code) {
            (Some(line), _) => line.to_string(),
            (None, Some(code)) => format!("hook exited with status {code}"),
            (None, None) => "hook killed by signal".to_string(),
        }
    }
}

/// Per-attempt output path next to the claimed item, removed on drop.
struct OutputFile {
    path: PathBuf,
}

impl OutputFile {
    fn beside(item: &Path) -> Self {
        let dir = item.parent().unwrap_or_else(|| Path::new("."));
        let name = item
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: dir.join(format!(".{name}.{}.out", Uuid::new_v4())),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if let Err(e) = item_store::safe_remove(&self.path) {
            warn!(path = %self.path.display(), "removing hook output failed: {e}");
        }
    }
}
