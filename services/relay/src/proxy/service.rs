//! Proxy service: port map, resolver and listeners wired together.
//!
//! Per connection:
//! 1. Map the local port the connection arrived on to its remote port
//! 2. Resolve the backend host (cached)
//! 3. Dial `host:remote_port` over the overlay transport
//! 4. On a failed resolution or dial, force one re-resolution and try once more
//! 5. Pipe bytes until both sides are done
//!
//! Any failure aborts that connection only.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{self, ListenerConfig, ListenerState};
use super::pipe::pipe;
use super::port_map::{PortBinding, PortMap, PortMapError};
use super::resolver::{BackendResolver, BackendService};
use crate::control_plane::ControlPlane;
use crate::error::RelayError;
use crate::transport::{Accepted, OverlayTransport};

/// Default connect timeout for backend dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the proxy needs to run, passed in explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Port bindings in configuration order.
    pub ports: Vec<PortBinding>,
    /// Service to forward to.
    pub backend: BackendService,
    pub listener: ListenerConfig,
    /// Timeout for each backend dial.
    pub connect_timeout: Duration,
    /// Idle timeout per copy direction (none by default).
    pub idle_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn new(ports: Vec<PortBinding>, backend: BackendService) -> Self {
        Self {
            ports,
            backend,
            listener: ListenerConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Relay counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections finished.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections on a port with no binding.
    pub lookup_failed: AtomicU64,
    /// Connections aborted because no backend address was available.
    pub resolution_failed: AtomicU64,
    /// Failed backend dials (including retries).
    pub dial_failed: AtomicU64,
    /// Dials retried after a forced re-resolution.
    pub dial_retried: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// The relay: owns the port map and resolver, starts listeners and proxies
/// accepted connections.
pub struct ProxyService<T: OverlayTransport> {
    config: ProxyConfig,
    port_map: PortMap,
    resolver: BackendResolver,
    transport: T,
    stats: Arc<RelayStats>,
}

impl<T: OverlayTransport> ProxyService<T> {
    pub fn new(
        config: ProxyConfig,
        transport: T,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Result<Self, PortMapError> {
        let port_map = PortMap::new(config.ports.clone())?;
        let resolver = BackendResolver::new(config.backend.clone(), control_plane);

        Ok(Self {
            config,
            port_map,
            resolver,
            transport,
            stats: Arc::new(RelayStats::default()),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn port_map(&self) -> &PortMap {
        &self.port_map
    }

    pub fn resolver(&self) -> &BackendResolver {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub(crate) fn stats_handle(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Start one listener task per binding and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listeners = self
            .port_map
            .bindings()
            .iter()
            .map(|binding| {
                let (state_tx, state_rx) = watch::channel(ListenerState::Unbound);
                let task = tokio::spawn(listener::serve(
                    Arc::clone(self),
                    binding.clone(),
                    state_tx,
                    shutdown_rx.clone(),
                ));
                ListenerHandle {
                    binding: binding.clone(),
                    state: state_rx,
                    task,
                }
            })
            .collect();

        info!(
            listener_count = self.port_map.len(),
            backend = %self.config.backend,
            "Proxy service started"
        );

        ServiceHandle {
            shutdown_tx,
            listeners,
        }
    }

    /// Proxy one accepted connection to the backend.
    pub async fn proxy_connection(&self, accepted: Accepted<T::Stream>) -> Result<(), RelayError> {
        let Accepted {
            stream: client,
            peer_addr,
            local_addr,
        } = accepted;

        let local_port = local_addr.port().to_string();
        let Some(remote_port) = self.port_map.remote_port_for(&local_port) else {
            self.stats.lookup_failed.fetch_add(1, Ordering::Relaxed);
            return Err(RelayError::Lookup { local_port });
        };

        debug!(
            peer_addr = %peer_addr,
            local_addr = %local_addr,
            remote_port = %remote_port,
            "Handling connection"
        );

        // One forced refresh per connection, spent on whichever step fails first.
        let mut refreshed = false;

        let host = match self.resolver.resolve().await {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "Backend resolution failed, forcing refresh");
                refreshed = true;
                self.refresh().await?
            }
        };

        let (backend, host) = match self.dial(&host, remote_port).await {
            Ok(stream) => (stream, host),
            Err(e) if !refreshed => {
                warn!(error = %e, "Backend dial failed, re-resolving");
                self.stats.dial_retried.fetch_add(1, Ordering::Relaxed);
                let host = self.refresh().await?;
                (self.dial(&host, remote_port).await?, host)
            }
            Err(e) => return Err(e),
        };

        self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
        debug!(backend_host = %host, "Connected to backend");

        let report = pipe(client, backend, self.config.idle_timeout).await;

        self.stats
            .bytes_to_backend
            .fetch_add(report.a_to_b.bytes, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(report.b_to_a.bytes, Ordering::Relaxed);

        debug!(
            bytes_to_backend = report.a_to_b.bytes,
            bytes_from_backend = report.b_to_a.bytes,
            "Pipe finished"
        );

        match report.a_to_b.error.or(report.b_to_a.error) {
            Some(e) => Err(RelayError::Stream(e)),
            None => Ok(()),
        }
    }

    /// Force one re-resolution, counting a failure against the connection.
    async fn refresh(&self) -> Result<String, RelayError> {
        self.resolver.invalidate_and_retry().await.map_err(|e| {
            self.stats.resolution_failed.fetch_add(1, Ordering::Relaxed);
            RelayError::from(e)
        })
    }

    async fn dial(&self, host: &str, remote_port: &str) -> Result<T::Stream, RelayError> {
        let address = join_host_port(host, remote_port);

        let result =
            match tokio::time::timeout(self.config.connect_timeout, self.transport.dial(&address))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            };

        result.map_err(|source| {
            self.stats.dial_failed.fetch_add(1, Ordering::Relaxed);
            RelayError::Dial { address, source }
        })
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A running listener task.
pub struct ListenerHandle {
    binding: PortBinding,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn binding(&self) -> &PortBinding {
        &self.binding
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until the listener is accepting, failed or closed.
    pub async fn wait_settled(&self) -> ListenerState {
        let mut state = self.state.clone();
        let settled = match state.wait_for(|s| s.is_settled()).await {
            Ok(s) => Some(*s),
            Err(_) => None,
        };
        // The task is gone without settling; report the last state it published.
        settled.unwrap_or_else(|| *state.borrow())
    }
}

/// Handle to a started proxy service.
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<ListenerHandle>,
}

impl ServiceHandle {
    pub fn listeners(&self) -> &[ListenerHandle] {
        &self.listeners
    }

    /// Current state of the listener for `local_port`.
    pub fn listener_state(&self, local_port: &str) -> Option<ListenerState> {
        self.listeners
            .iter()
            .find(|l| l.binding.local_port == local_port)
            .map(ListenerHandle::state)
    }

    /// Wait for every listener to finish starting up.
    pub async fn wait_settled(&self) -> Vec<(PortBinding, ListenerState)> {
        let mut states = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            states.push((listener.binding.clone(), listener.wait_settled().await));
        }
        states
    }

    /// Stop all accept loops. In-flight connections keep running.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        for listener in self.listeners {
            if let Err(e) = listener.task.await {
                error!(
                    local_port = %listener.binding.local_port,
                    error = %e,
                    "Listener task failed"
                );
            }
        }
    }
}
