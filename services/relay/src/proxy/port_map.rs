//! Static local-port to remote-port table.
//!
//! Built once at startup from configuration. Lookups match the local port
//! string exactly; a miss is an expected outcome, not an error. Ports must be
//! written in plain decimal so the configured string is the same one a
//! connection's local port renders to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single forwarded port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port on the backend service that traffic is forwarded to.
    #[serde(alias = "RemotePort", alias = "remoteport")]
    pub remote_port: String,
    /// Port bound on the overlay network.
    #[serde(alias = "LocalPort", alias = "localport")]
    pub local_port: String,
}

impl PortBinding {
    pub fn new(local_port: impl Into<String>, remote_port: impl Into<String>) -> Self {
        Self {
            remote_port: remote_port.into(),
            local_port: local_port.into(),
        }
    }

    /// Local port as a bindable number.
    pub fn local_port_number(&self) -> Result<u16, PortMapError> {
        parse_port(&self.local_port)
    }
}

/// Errors raised while building a port map.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortMapError {
    #[error("local port {0} is bound more than once")]
    DuplicateLocalPort(String),

    #[error("invalid port {port:?}: {reason}")]
    InvalidPort { port: String, reason: &'static str },

    #[error("no port bindings configured")]
    Empty,
}

fn parse_port(port: &str) -> Result<u16, PortMapError> {
    match port.parse::<u16>() {
        Ok(0) => Err(PortMapError::InvalidPort {
            port: port.to_string(),
            reason: "port 0 is not allowed",
        }),
        Ok(n) if n.to_string() != port => Err(PortMapError::InvalidPort {
            port: port.to_string(),
            reason: "expected plain decimal without sign or leading zeros",
        }),
        Ok(n) => Ok(n),
        Err(_) => Err(PortMapError::InvalidPort {
            port: port.to_string(),
            reason: "expected an integer in 1..=65535",
        }),
    }
}

/// Ordered, immutable set of port bindings keyed by local port.
#[derive(Debug, Clone)]
pub struct PortMap {
    bindings: Vec<PortBinding>,
    by_local: HashMap<String, String>,
}

impl PortMap {
    /// Build a port map, rejecting duplicate or unparseable ports.
    pub fn new(bindings: Vec<PortBinding>) -> Result<Self, PortMapError> {
        if bindings.is_empty() {
            return Err(PortMapError::Empty);
        }

        let mut by_local = HashMap::with_capacity(bindings.len());
        for binding in &bindings {
            parse_port(&binding.local_port)?;
            parse_port(&binding.remote_port)?;

            if by_local
                .insert(binding.local_port.clone(), binding.remote_port.clone())
                .is_some()
            {
                return Err(PortMapError::DuplicateLocalPort(binding.local_port.clone()));
            }
        }

        Ok(Self { bindings, by_local })
    }

    /// Remote port configured for `local_port`, if any.
    pub fn remote_port_for(&self, local_port: &str) -> Option<&str> {
        self.by_local.get(local_port).map(String::as_str)
    }

    /// Bindings in configuration order.
    pub fn bindings(&self) -> &[PortBinding] {
        &self.bindings
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }
}
