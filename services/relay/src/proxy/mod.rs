//! Dynamic-backend TCP relay.
//!
//! This module provides:
//! - A static local-port to remote-port map
//! - Backend address resolution with a cache and a single forced refresh
//! - Overlay listener management
//! - Bidirectional connection piping
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> PortMap -> BackendResolver -> dial(host:remote_port) -> Backend
//!                                        |
//!                               ControlPlane (on cold cache / dial failure)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use kube_relay::{ProxyConfig, ProxyService, TcpTransport};
//!
//! let service = Arc::new(ProxyService::new(config, transport, control_plane)?);
//! let handle = service.start();
//! handle.wait_settled().await;
//! ```

mod listener;
mod pipe;
mod port_map;
mod resolver;
mod service;

pub use listener::{Listener, ListenerConfig, ListenerState, DEFAULT_MAX_CONNECTIONS};
pub use pipe::{pipe, PipeReport, Transfer};
pub use port_map::{PortBinding, PortMap, PortMapError};
pub use resolver::{BackendAddress, BackendResolver, BackendService, ResolveError};
pub use service::{
    join_host_port, ListenerHandle, ProxyConfig, ProxyService, RelayStats, ServiceHandle,
    DEFAULT_CONNECT_TIMEOUT,
};
