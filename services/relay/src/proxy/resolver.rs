//! Backend address resolution and caching.
//!
//! The backend is a load-balanced cluster service whose address is stable once
//! assigned but may change on failover. The resolver caches the last address
//! it saw and only goes back to the control plane when the cache is empty or a
//! caller reports that dialing the cached address failed.
//!
//! - No proactive expiry or background refresh
//! - A forced refresh issues exactly one control-plane query
//! - Cold-cache lookups are serialized so concurrent connections share one query
//! - The cached host stays readable while a forced refresh is in flight

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError};

/// The cluster service traffic is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendService {
    pub namespace: String,
    #[serde(alias = "service")]
    pub name: String,
}

impl Default for BackendService {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            name: "traefik".to_string(),
        }
    }
}

impl std::fmt::Display for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A resolved backend host and when it was cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddress {
    pub host: String,
    pub cached_at: Instant,
}

/// Failure to produce a dialable backend address.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("control plane lookup for {namespace}/{service} failed: {source}")]
    ControlPlane {
        namespace: String,
        service: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("service {namespace}/{service} has no address yet")]
    NoAddress { namespace: String, service: String },
}

/// Resolves and caches the backend service address.
pub struct BackendResolver {
    service: BackendService,
    control_plane: Arc<dyn ControlPlane>,
    cached: ArcSwapOption<BackendAddress>,
    refresh_lock: Mutex<()>,
    queries: AtomicU64,
}

impl BackendResolver {
    pub fn new(service: BackendService, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            service,
            control_plane,
            cached: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            queries: AtomicU64::new(0),
        }
    }

    /// The service this resolver looks up.
    pub fn service(&self) -> &BackendService {
        &self.service
    }

    /// Currently cached address, if any.
    pub fn cached(&self) -> Option<Arc<BackendAddress>> {
        self.cached.load_full()
    }

    /// Number of control-plane queries issued so far.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Return the cached host, querying the control plane only on a cold cache.
    pub async fn resolve(&self) -> Result<String, ResolveError> {
        if let Some(addr) = self.cached.load_full() {
            return Ok(addr.host.clone());
        }

        let _guard = self.refresh_lock.lock().await;

        // Another task may have filled the cache while we waited.
        if let Some(addr) = self.cached.load_full() {
            return Ok(addr.host.clone());
        }

        self.query().await
    }

    /// Query the control plane exactly once, replacing the cached host.
    ///
    /// Used after dialing the cached host failed. The stale host stays
    /// readable while the query runs so other connections are not held up;
    /// it is cleared only if the query fails. A failure here is returned to
    /// the caller and is not retried again.
    pub async fn invalidate_and_retry(&self) -> Result<String, ResolveError> {
        let _guard = self.refresh_lock.lock().await;
        let stale = self.cached.load_full();

        let result = self.query().await;

        if result.is_err() {
            // Only clear the entry we saw; a newer host stays cached.
            let previous = self.cached.compare_and_swap(&stale, None);
            if let (Some(prev), Some(stale)) = (&*previous, &stale) {
                if Arc::ptr_eq(prev, stale) {
                    debug!(
                        backend = %self.service,
                        host = %stale.host,
                        cached_for_ms = stale.cached_at.elapsed().as_millis() as u64,
                        "Invalidated cached backend address"
                    );
                }
            }
        }

        result
    }

    async fn query(&self) -> Result<String, ResolveError> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let addresses = self
            .control_plane
            .get_service_address(&self.service.namespace, &self.service.name)
            .await
            .map_err(|source| {
                warn!(
                    namespace = %self.service.namespace,
                    service = %self.service.name,
                    error = %source,
                    "Control plane lookup failed"
                );
                ResolveError::ControlPlane {
                    namespace: self.service.namespace.clone(),
                    service: self.service.name.clone(),
                    source,
                }
            })?;

        let Some(host) = addresses.into_iter().next() else {
            warn!(
                namespace = %self.service.namespace,
                service = %self.service.name,
                "Service has no address"
            );
            return Err(ResolveError::NoAddress {
                namespace: self.service.namespace.clone(),
                service: self.service.name.clone(),
            });
        };

        let previous = self.cached.swap(Some(Arc::new(BackendAddress {
            host: host.clone(),
            cached_at: Instant::now(),
        })));

        match previous {
            Some(prev) if prev.host == host => {}
            _ => info!(backend = %self.service, host = %host, "Backend address resolved"),
        }

        Ok(host)
    }
}
