//! Capability probes: can this endpoint serve this request right now?

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::config::secrets::bearer;
use crate::error::Result;
use crate::model::Endpoint;

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

/// Checks whether an endpoint advertises a capability.
///
/// `Err` means the endpoint could not be asked; the pool logs it and
/// treats the endpoint as unavailable for that one acquisition.
pub trait CapabilityProbe: Send + Sync {
    fn probe<'a>(&'a self, endpoint: &'a Endpoint, capability: &'a str, timeout: Duration) -> ProbeFuture<'a>;
}

/// Asks an Ollama-style server for its model list via `GET /api/tags`.
#[derive(Debug, Clone, Default)]
pub struct HttpTagProbe {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    #[serde(default)]
    name: String,
}

impl HttpTagProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl CapabilityProbe for HttpTagProbe {
    fn probe<'a>(&'a self, endpoint: &'a Endpoint, capability: &'a str, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            let url = tags_url(&endpoint.url);
            let mut request = self.client.get(&url).timeout(timeout);
            if let Some(key) = &endpoint.api_key {
                request = request.header(reqwest::header::AUTHORIZATION, bearer(key));
            }

            let tags: TagsResponse = request.send().await?.error_for_status()?.json().await?;
            let found = tags.models.iter().any(|m| model_matches(&m.name, capability));
            if !found {
                debug!(endpoint = %endpoint.url, capability, "capability not advertised");
            }
            Ok(found)
        })
    }
}

/// `http://host:11434/api/generate` and `http://host:11434` both map to
/// `http://host:11434/api/tags`.
pub fn tags_url(url: &str) -> String {
    let base = url.trim_end_matches('/');
    let base = base.strip_suffix("/api/generate").unwrap_or(base);
    format!("{base}/api/tags")
}

/// Exact name, implicit `:latest`, or same base name when a variant was asked for.
pub fn model_matches(listed: &str, wanted: &str) -> bool {
    if listed == wanted || listed.strip_suffix(":latest") == Some(wanted) {
        return true;
    }
    match (wanted.split_once(':'), listed.split(':').next()) {
        (Some((wanted_base, _)), Some(listed_base)) => wanted_base == listed_base,
        _ => false,
    }
}
