//! Overlay listeners and accept loops.
//!
//! One listener is bound per port binding, each in its own task, so a slow or
//! failing port never keeps the others from opening. Every accepted
//! connection is handed to its own task and the loop goes straight back to
//! accepting.
//!
//! Lifecycle per binding:
//!
//! ```text
//! Unbound -> Bound -> Accepting -> Closed
//!    |
//!    +-> Failed (bind error; other listeners are unaffected)
//! ```

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::port_map::PortBinding;
use super::service::ProxyService;
use crate::error::RelayError;
use crate::transport::{Accepted, OverlayListener, OverlayTransport};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Pause after an accept error before accepting again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Lifecycle state of a port binding's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Bound,
    Accepting,
    /// The port could not be bound.
    Failed,
    /// The accept loop ended (shutdown or the listener was closed).
    Closed,
}

impl ListenerState {
    /// Whether startup for this listener is over, one way or the other.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            ListenerState::Accepting | ListenerState::Failed | ListenerState::Closed
        )
    }
}

/// A bound listener for one port binding.
pub struct Listener<T: OverlayTransport> {
    binding: PortBinding,
    inner: T::Listener,
    service: Arc<ProxyService<T>>,
    conn_semaphore: Arc<Semaphore>,
}

impl<T: OverlayTransport> Listener<T> {
    /// Bind the binding's local port on the overlay transport.
    pub async fn bind(service: Arc<ProxyService<T>>, binding: PortBinding) -> Result<Self, RelayError> {
        let port = binding.local_port_number().map_err(|e| RelayError::Bind {
            port: binding.local_port.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let inner = service
            .transport()
            .listen(port)
            .await
            .map_err(|source| RelayError::Bind {
                port: binding.local_port.clone(),
                source,
            })?;

        match inner.local_addr() {
            Ok(addr) => info!(
                bind_addr = %addr,
                local_port = %binding.local_port,
                remote_port = %binding.remote_port,
                "Listener bound"
            ),
            Err(e) => debug!(error = %e, "Bound listener has no local address"),
        }

        let max_connections = service.config().listener.max_connections;

        Ok(Self {
            binding,
            inner,
            service,
            conn_semaphore: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Accept connections until shutdown or until the listener closes.
    pub async fn run(self, state: watch::Sender<ListenerState>, mut shutdown: watch::Receiver<bool>) {
        state.send_replace(ListenerState::Accepting);
        info!(local_port = %self.binding.local_port, "Listener started");

        loop {
            let accepted = tokio::select! {
                result = self.inner.accept() => result,
                _ = shutdown_requested(&mut shutdown) => {
                    info!(local_port = %self.binding.local_port, "Listener shutting down");
                    break;
                }
            };

            match accepted {
                Ok(Some(accepted)) => self.dispatch(accepted),
                Ok(None) => {
                    info!(local_port = %self.binding.local_port, "Listener closed");
                    break;
                }
                Err(e) => {
                    let err = RelayError::Accept(e);
                    error!(
                        local_port = %self.binding.local_port,
                        error = %err,
                        reason = err.reason_code(),
                        "Accept error"
                    );
                    // Avoid a tight loop on persistent errors
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        state.send_replace(ListenerState::Closed);
    }

    /// Hand a connection to its own task.
    fn dispatch(&self, accepted: Accepted<T::Stream>) {
        let stats = self.service.stats_handle();
        let peer_addr = accepted.peer_addr;

        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_addr = %peer_addr,
                    local_port = %self.binding.local_port,
                    "Connection rejected: max connections reached"
                );
                return;
            }
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let service = Arc::clone(&self.service);
        let span = tracing::info_span!(
            "connection",
            peer = %peer_addr,
            local_port = %self.binding.local_port
        );

        tokio::spawn(
            async move {
                match service.proxy_connection(accepted).await {
                    Ok(()) => debug!("Connection closed"),
                    Err(e) => log_connection_error(&e),
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Bind and run the listener for one binding, publishing its state.
pub(crate) async fn serve<T: OverlayTransport>(
    service: Arc<ProxyService<T>>,
    binding: PortBinding,
    state: watch::Sender<ListenerState>,
    shutdown: watch::Receiver<bool>,
) {
    let listener = match Listener::bind(service, binding.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                local_port = %binding.local_port,
                error = %e,
                reason = e.reason_code(),
                "Failed to bind listener"
            );
            state.send_replace(ListenerState::Failed);
            return;
        }
    };

    state.send_replace(ListenerState::Bound);
    listener.run(state, shutdown).await;
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_connection_error(err: &RelayError) {
    match err {
        RelayError::Lookup { .. } | RelayError::Dial { .. } => {
            warn!(error = %err, reason = err.reason_code(), "Connection aborted")
        }
        RelayError::Resolution(_) => {
            error!(error = %err, reason = err.reason_code(), "Connection aborted")
        }
        RelayError::Stream(_) => {
            debug!(error = %err, reason = err.reason_code(), "Connection ended with error")
        }
        RelayError::Bind { .. } | RelayError::Accept(_) => {
            error!(error = %err, reason = err.reason_code(), "Unexpected connection error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_listener_state_settled() {
        assert!(!ListenerState::Unbound.is_settled());
        assert!(!ListenerState::Bound.is_settled());
        assert!(ListenerState::Accepting.is_settled());
        assert!(ListenerState::Failed.is_settled());
        assert!(ListenerState::Closed.is_settled());
    }

    #[tokio::test]
    async fn test_shutdown_requested_ignores_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);

        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown_requested(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_requested_fires() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_requested(&mut rx).await });
        tx.send_replace(true);
        waiter.await.unwrap();
    }
}
