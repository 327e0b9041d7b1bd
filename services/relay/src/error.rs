//! Relay error taxonomy.

use std::io;

use thiserror::Error;

use crate::proxy::ResolveError;

/// Errors raised by listeners and per-connection handling.
///
/// Every variant is contained to the listener or connection it occurred on.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A configured port could not be bound.
    #[error("bind_failed: port {port}: {source}")]
    Bind {
        port: String,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// The local port is not in the port map.
    #[error("no_port_binding: local port {local_port}")]
    Lookup { local_port: String },

    /// No backend address could be resolved.
    #[error("resolution_failed: {0}")]
    Resolution(#[from] ResolveError),

    /// The backend could not be dialed.
    #[error("dial_failed: {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    /// A copy direction failed mid-stream.
    #[error("stream_failed: {0}")]
    Stream(#[source] io::Error),
}

impl RelayError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Accept(_) => "accept_failed",
            RelayError::Lookup { .. } => "no_port_binding",
            RelayError::Resolution(_) => "resolution_failed",
            RelayError::Dial { .. } => "dial_failed",
            RelayError::Stream(_) => "stream_failed",
        }
    }
}
