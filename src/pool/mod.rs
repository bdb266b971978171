//! Endpoint pool: arbitrates access to remote workers with fixed
//! concurrency limits.
//!
//! Each (endpoint, slot) pair is one lock from a [`LockProvider`]. An
//! acquisition filters endpoints by capability, then makes up to
//! `max_attempts` passes over the shuffled endpoints trying every slot,
//! sleeping `base_wait + jitter` between passes. A held slot is returned as
//! a [`Lease`], which releases itself when dropped.
//!
//! The pool also remembers every slot it handed out, so a signal handler
//! can call [`ResourcePool::cleanup_all`] and leave no busy slots behind.

pub mod probe;
pub mod retry;

pub use probe::{CapabilityProbe, HttpTagProbe};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PoolSettings;
use crate::error::Result;
use crate::lock::{FileLockProvider, LeaseExpiry, LockProvider};
use crate::model::Endpoint;
use crate::telemetry::metrics;

/// A pool of endpoints sharing one lock provider.
///
/// Cheap to clone; clones share the same tracked slots.
pub struct ResourcePool<L: LockProvider = FileLockProvider> {
    inner: Arc<PoolInner<L>>,
}

impl<L: LockProvider> Clone for ResourcePool<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<L: LockProvider> {
    endpoints: Vec<Endpoint>,
    provider: L,
    retry: RetryPolicy,
    probe: Option<Arc<dyn CapabilityProbe>>,
    probe_timeout: Duration,
    active: Mutex<HashMap<u64, ActiveSlot<L::Held>>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

struct ActiveSlot<H> {
    held: H,
    endpoint: usize,
    slot: u32,
}

/// What [`ResourcePool::cleanup_all`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Tracked slots released.
    pub released: usize,
    /// Leftover slot files of this process removed from the lock directory.
    pub swept: usize,
}

impl ResourcePool<FileLockProvider> {
    /// Build a file-locked pool from its configuration section.
    pub fn from_settings(settings: PoolSettings) -> Result<Self> {
        let mut provider = FileLockProvider::new(&settings.lock_dir)?;
        if let Some(secs) = settings.lease_max_age_secs {
            provider = provider.with_liveness(Arc::new(LeaseExpiry::new(Duration::from_secs(secs))));
        }

        let retry = RetryPolicy::new(
            settings.retry_wait(),
            settings.retry_jitter(),
            settings.max_attempts,
        );
        let probe_timeout = settings.probe_timeout();
        let check_capability = settings.check_capability;
        let endpoints = settings.endpoints.into_iter().map(Endpoint::from).collect();

        Ok(if check_capability {
            ResourcePool::with_probe(endpoints, provider, retry, Arc::new(HttpTagProbe::new()), probe_timeout)
        } else {
            ResourcePool::new(endpoints, provider, retry)
        })
    }
}

impl<L: LockProvider> ResourcePool<L> {
    /// A pool without capability filtering.
    pub fn new(endpoints: Vec<Endpoint>, provider: L, retry: RetryPolicy) -> Self {
        Self::build(endpoints, provider, retry, None, Duration::from_secs(5))
    }

    /// A pool that asks `probe` which endpoints can serve a capability,
    /// each probe bounded by `probe_timeout`.
    pub fn with_probe(
        endpoints: Vec<Endpoint>,
        provider: L,
        retry: RetryPolicy,
        probe: Arc<dyn CapabilityProbe>,
        probe_timeout: Duration,
    ) -> Self {
        Self::build(endpoints, provider, retry, Some(probe), probe_timeout)
    }

    fn build(
        endpoints: Vec<Endpoint>,
        provider: L,
        retry: RetryPolicy,
        probe: Option<Arc<dyn CapabilityProbe>>,
        probe_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                endpoints,
                provider,
                retry,
                probe,
                probe_timeout,
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    pub fn provider(&self) -> &L {
        &self.inner.provider
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// Number of slots currently handed out by this pool.
    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    /// Acquire a slot on any endpoint that advertises `capability`.
    ///
    /// `None` means no slot could be had: no capable endpoint, every slot
    /// busy for all passes, or the pool was shut down while waiting.
    pub async fn acquire(&self, capability: Option<&str>, tag: &str) -> Option<Lease<L>> {
        self.acquire_until(capability, tag, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up instead of sleeping
    /// past `deadline`.
    pub async fn acquire_until(
        &self,
        capability: Option<&str>,
        tag: &str,
        deadline: Option<Instant>,
    ) -> Option<Lease<L>> {
        let started = Instant::now();
        let outcome = self.acquire_inner(capability, tag, deadline).await;

        let result = match &outcome {
            Ok(_) => "acquired",
            Err(reason) => reason.as_str(),
        };
        let labels = [KeyValue::new("result", result)];
        metrics::slot_acquisitions().add(1, &labels);
        metrics::slot_wait_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);

        outcome.ok()
    }

    async fn acquire_inner(
        &self,
        capability: Option<&str>,
        tag: &str,
        deadline: Option<Instant>,
    ) -> std::result::Result<Lease<L>, NoLease> {
        if self.is_shut_down() {
            return Err(NoLease::Cancelled);
        }

        let eligible = self.eligible(capability).await;
        if eligible.is_empty() {
            error!(
                capability = capability.unwrap_or("-"),
                endpoints = self.inner.endpoints.len(),
                tag,
                "no endpoint can serve this request"
            );
            return Err(NoLease::NoCapableEndpoint);
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        let attempts = self.inner.retry.attempts();

        for attempt in 1..=attempts {
            let mut order = eligible.clone();
            order.shuffle(&mut rand::rng());

            if let Some(lease) = self.try_pass(&order, tag) {
                debug!(
                    endpoint = %lease.url(),
                    slot = lease.slot(),
                    tag,
                    attempt,
                    attempts,
                    "acquired endpoint slot"
                );
                return Ok(lease);
            }

            if attempt == attempts {
                break;
            }

            let wait = self.inner.retry.next_wait();
            if deadline.is_some_and(|d| Instant::now() + wait > d) {
                warn!(tag, attempt, "acquisition deadline reached");
                return Err(NoLease::Exhausted);
            }
            debug!(tag, attempt, attempts, wait_ms = wait.as_millis() as u64, "all slots busy, waiting");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!(tag, "pool shut down during acquisition");
                    return Err(NoLease::Cancelled);
                }
            }
        }

        error!(tag, attempts, "failed to acquire an endpoint slot");
        Err(NoLease::Exhausted)
    }

    /// Indices of endpoints that may serve `capability`.
    ///
    /// Without a capability or a probe every endpoint is eligible. A probe
    /// error or timeout excludes the endpoint for this call only.
    async fn eligible(&self, capability: Option<&str>) -> Vec<usize> {
        let all = (0..self.inner.endpoints.len()).collect::<Vec<_>>();
        let (Some(capability), Some(probe)) = (capability, self.inner.probe.as_ref()) else {
            return all;
        };

        let timeout = self.inner.probe_timeout;
        let mut eligible = Vec::with_capacity(all.len());
        for idx in all {
            let endpoint = &self.inner.endpoints[idx];
            match tokio::time::timeout(timeout, probe.probe(endpoint, capability, timeout)).await {
                Ok(Ok(true)) => eligible.push(idx),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(endpoint = %endpoint.url, capability, "capability probe failed: {e}"),
                Err(_) => warn!(endpoint = %endpoint.url, capability, "capability probe timed out"),
            }
        }
        debug!(
            capability,
            eligible = eligible.len(),
            total = self.inner.endpoints.len(),
            "filtered endpoints by capability"
        );
        eligible
    }

    /// One pass over every slot of every endpoint in `order`.
    fn try_pass(&self, order: &[usize], tag: &str) -> Option<Lease<L>> {
        for &idx in order {
            let endpoint = &self.inner.endpoints[idx];
            for slot in 0..endpoint.max_concurrent {
                match self.inner.provider.try_acquire(endpoint, slot, tag) {
                    Ok(Some(held)) => return Some(self.track(held, idx, slot)),
                    Ok(None) => {}
                    Err(e) => warn!(endpoint = %endpoint.url, slot, "slot lock error: {e}"),
                }
            }
        }
        None
    }

    fn track(&self, held: L::Held, endpoint: usize, slot: u32) -> Lease<L> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock_active()
            .insert(id, ActiveSlot { held, endpoint, slot });
        Lease {
            pool: Arc::clone(&self.inner),
            id,
            endpoint,
            slot,
        }
    }

    /// Give a slot back. Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease<L>) {
        drop(lease);
    }

    /// Wake and fail any acquisition that is waiting between passes, and
    /// refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Release every slot this pool handed out, then sweep the lock
    /// directory for leftovers of this process. Best effort: errors are
    /// logged, never returned.
    pub fn cleanup_all(&self) -> CleanupReport {
        let drained: Vec<ActiveSlot<L::Held>> = {
            let mut active = self.inner.lock_active();
            active.drain().map(|(_, slot)| slot).collect()
        };

        let mut report = CleanupReport::default();
        for mut active in drained {
            let url = &self.inner.endpoints[active.endpoint].url;
            match self.inner.provider.release(&mut active.held) {
                Ok(()) => report.released += 1,
                Err(e) => warn!(endpoint = %url, slot = active.slot, "releasing tracked slot: {e}"),
            }
        }

        match self.inner.provider.sweep_own() {
            Ok(swept) => report.swept = swept,
            Err(e) => warn!("lock directory sweep failed: {e}"),
        }

        info!(released = report.released, swept = report.swept, "pool cleanup complete");
        report
    }
}

impl<L: LockProvider> PoolInner<L> {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<u64, ActiveSlot<L::Held>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_id(&self, id: u64) {
        let Some(mut active) = self.lock_active().remove(&id) else {
            return;
        };
        if let Err(e) = self.provider.release(&mut active.held) {
            warn!(
                endpoint = %self.endpoints[active.endpoint].url,
                slot = active.slot,
                "releasing slot: {e}"
            );
        }
    }
}

#[derive(Debug)]
enum NoLease {
    NoCapableEndpoint,
    Exhausted,
    Cancelled,
}

impl NoLease {
    fn as_str(&self) -> &'static str {
        match self {
            NoLease::NoCapableEndpoint => "no_capable_endpoint",
            NoLease::Exhausted => "exhausted",
            NoLease::Cancelled => "cancelled",
        }
    }
}

/// A held endpoint slot. Released when dropped, on every exit path.
pub struct Lease<L: LockProvider = FileLockProvider> {
    pool: Arc<PoolInner<L>>,
    id: u64,
    endpoint: usize,
    slot: u32,
}

impl<L: LockProvider> Lease<L> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.pool.endpoints[self.endpoint]
    }

    pub fn url(&self) -> &str {
        &self.endpoint().url
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl<L: LockProvider> std::fmt::Debug for Lease<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("url", &self.url())
            .field("slot", &self.slot)
            .finish()
    }
}

impl<L: LockProvider> Drop for Lease<L> {
    fn drop(&mut self) {
        self.pool.release_id(self.id);
    }
}
