//! Cluster control-plane client.
//!
//! The relay only needs one question answered: what is the current address of
//! service `name` in `namespace`. The [`ControlPlane`] trait is that seam; the
//! [`KubeControlPlane`] implementation asks the Kubernetes API server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Default in-cluster service account token path.
pub const IN_CLUSTER_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Default in-cluster CA bundle path.
pub const IN_CLUSTER_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Request timeout for API server calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure to look up a service address.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlPlaneError {
    /// The service does not exist.
    #[error("service {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// Credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unexpected HTTP status from the API server.
    #[error("api server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The API server could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Service address lookup.
///
/// A successful response may carry zero addresses, e.g. when a load balancer
/// has not been provisioned yet. Callers decide what that means.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_service_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ControlPlaneError>;
}

/// Connection settings for the Kubernetes API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeApiConfig {
    /// API server base URL (example: https://10.96.0.1:443).
    pub api_url: String,
    /// Bearer token file, re-read on every request so rotated tokens are picked up.
    pub token_file: Option<PathBuf>,
    /// PEM CA bundle used to verify the API server.
    pub ca_file: Option<PathBuf>,
}

impl KubeApiConfig {
    /// In-cluster settings derived from the service environment.
    pub fn in_cluster(host: &str, port: &str) -> Self {
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        Self {
            api_url: format!("https://{}:{}", host, port),
            token_file: Some(PathBuf::from(IN_CLUSTER_TOKEN_FILE)),
            ca_file: Some(PathBuf::from(IN_CLUSTER_CA_FILE)),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServiceObject {
    #[serde(default)]
    spec: ServiceSpec,
    #[serde(default)]
    status: ServiceStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceSpec {
    #[serde(rename = "externalIPs", default)]
    external_ips: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceStatus {
    #[serde(rename = "loadBalancer", default)]
    load_balancer: LoadBalancerStatus,
}

#[derive(Debug, Default, Deserialize)]
struct LoadBalancerStatus {
    #[serde(default)]
    ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Default, Deserialize)]
struct LoadBalancerIngress {
    ip: Option<String>,
    hostname: Option<String>,
}

impl ServiceObject {
    /// Load balancer ingress first, then external IPs.
    fn addresses(self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .status
            .load_balancer
            .ingress
            .into_iter()
            .filter_map(|i| i.ip.or(i.hostname))
            .filter(|a| !a.is_empty())
            .collect();
        addresses.extend(self.spec.external_ips.into_iter().filter(|a| !a.is_empty()));
        addresses
    }
}

/// Kubernetes API client for service lookups.
pub struct KubeControlPlane {
    client: reqwest::Client,
    api_url: String,
    token_file: Option<PathBuf>,
}

impl KubeControlPlane {
    /// Create a client, loading the CA bundle if one is configured.
    pub fn new(config: &KubeApiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .user_agent(concat!("kube-relay/", env!("CARGO_PKG_VERSION")));

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file)
                .with_context(|| format!("Failed to read CA bundle {}", ca_file.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid CA bundle {}", ca_file.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token_file: config.token_file.clone(),
        })
    }

    async fn read_token(path: &Path) -> Result<String, ControlPlaneError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ControlPlaneError::Unauthorized(format!(
                "failed to read token file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(raw.trim().to_string())
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_service_address(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<String>, ControlPlaneError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/services/{}",
            self.api_url, namespace, name
        );
        debug!(url = %url, "Fetching service");

        let mut request = self.client.get(&url);
        if let Some(path) = &self.token_file {
            request = request.bearer_auth(Self::read_token(path).await?);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ControlPlaneError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                404 => ControlPlaneError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                },
                401 | 403 => ControlPlaneError::Unauthorized(format!("{}: {}", status, body)),
                code => {
                    warn!(status = code, body = %body, "Service lookup failed");
                    ControlPlaneError::Status { status: code, body }
                }
            });
        }

        let service: ServiceObject = response
            .json()
            .await
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

        let addresses = service.addresses();
        debug!(
            namespace = %namespace,
            service = %name,
            address_count = addresses.len(),
            "Fetched service"
        );

        Ok(addresses)
    }
}
