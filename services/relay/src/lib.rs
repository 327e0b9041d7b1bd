pub mod config;
pub mod control_plane;
pub mod error;
pub mod proxy;
pub mod transport;

pub use control_plane::{ControlPlane, ControlPlaneError, KubeApiConfig, KubeControlPlane};
pub use error::RelayError;
pub use proxy::{
    BackendResolver, BackendService, ListenerState, PortBinding, PortMap, ProxyConfig,
    ProxyService, RelayStats, ResolveError, ServiceHandle,
};
pub use transport::{Accepted, OverlayListener, OverlayTransport, RelayStream, TcpTransport};
