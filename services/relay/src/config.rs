//! Relay configuration.
//!
//! Defaults, then a JSON config file, then `RELAY_*` environment overrides.
//! The result is an explicit value handed to the proxy service.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::control_plane::KubeApiConfig;
use crate::proxy::{
    BackendService, ListenerConfig, PortBinding, PortMap, ProxyConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS,
};

/// Config files probed when `RELAY_CONFIG_FILE` is not set.
pub const CONFIG_SEARCH_PATHS: [&str; 2] = ["/config/config.json", "config.json"];

/// Where defaults are written on first run.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// On-disk configuration format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Cluster service to forward to.
    #[serde(default, alias = "traefik")]
    pub backend: BackendService,

    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub kube: KubeSection,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub ports: Vec<PortBinding>,
    /// Overlay interface address listeners bind to.
    pub listen_addr: IpAddr,
    pub connect_timeout_ms: u64,
    pub idle_timeout_secs: Option<u64>,
    pub max_connections: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            ports: vec![PortBinding::new("443", "443"), PortBinding::new("80", "80")],
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            idle_timeout_secs: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Kubernetes API access. Empty means in-cluster discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeSection {
    pub api_url: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            backend: BackendService::default(),
            proxy: ProxySection::default(),
            kube: KubeSection::default(),
            log_level: default_log_level(),
        }
    }
}

/// Where the file-level configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Read from an existing file.
    File(PathBuf),
    /// No file existed; defaults were written here.
    CreatedDefault(PathBuf),
    /// No file existed and the defaults could not be written.
    Defaults { write_error: String },
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,
    /// Overlay interface address listeners bind to.
    pub listen_addr: IpAddr,
    pub kube: KubeApiConfig,
    pub log_level: String,
    pub source: ConfigSource,
}

impl Config {
    /// Load configuration from the config file and environment.
    pub fn load() -> Result<Self> {
        let search_paths: Vec<PathBuf> = CONFIG_SEARCH_PATHS.iter().map(PathBuf::from).collect();
        Self::load_from(
            &|key: &str| std::env::var(key).ok(),
            &search_paths,
            Path::new(DEFAULT_CONFIG_PATH),
        )
    }

    fn load_from(
        env: &dyn Fn(&str) -> Option<String>,
        search_paths: &[PathBuf],
        default_path: &Path,
    ) -> Result<Self> {
        let (mut file, source) = match env("RELAY_CONFIG_FILE") {
            Some(path) => {
                let path = PathBuf::from(path);
                (read_config_file(&path)?, ConfigSource::File(path))
            }
            None => match search_paths.iter().find(|p| p.exists()) {
                Some(path) => (read_config_file(path)?, ConfigSource::File(path.clone())),
                None => {
                    let defaults = FileConfig::default();
                    let source = match write_config_file(default_path, &defaults) {
                        Ok(()) => ConfigSource::CreatedDefault(default_path.to_path_buf()),
                        Err(e) => ConfigSource::Defaults {
                            write_error: format!("{:#}", e),
                        },
                    };
                    (defaults, source)
                }
            },
        };

        apply_env_overrides(&mut file, env)?;

        let kube = kube_api_config(&file.kube, env)?;

        let ports = file.proxy.ports.clone();
        PortMap::new(ports.clone()).context("Invalid port bindings")?;

        if file.proxy.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }

        let proxy = ProxyConfig {
            ports,
            backend: file.backend.clone(),
            listener: ListenerConfig {
                max_connections: file.proxy.max_connections,
            },
            connect_timeout: Duration::from_millis(file.proxy.connect_timeout_ms.max(1)),
            idle_timeout: file
                .proxy
                .idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        Ok(Self {
            proxy,
            listen_addr: file.proxy.listen_addr,
            kube,
            log_level: file.log_level,
            source,
        })
    }
}

fn read_config_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

fn write_config_file(path: &Path, config: &FileConfig) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))
}

/// Parse `local:remote[,local:remote...]`.
pub fn parse_port_list(raw: &str) -> Result<Vec<PortBinding>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (local, remote) = entry
                .split_once(':')
                .with_context(|| format!("Port binding {:?} must be local:remote", entry))?;
            Ok(PortBinding::new(local.trim(), remote.trim()))
        })
        .collect()
}

fn parse_env<T: std::str::FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{} has an invalid value", key))
}

fn apply_env_overrides(file: &mut FileConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(level) = env("RELAY_LOG_LEVEL") {
        file.log_level = level;
    }
    if let Some(namespace) = env("RELAY_BACKEND_NAMESPACE") {
        file.backend.namespace = namespace;
    }
    if let Some(name) = env("RELAY_BACKEND_SERVICE") {
        file.backend.name = name;
    }
    if let Some(ports) = env("RELAY_PORTS") {
        file.proxy.ports = parse_port_list(&ports)?;
    }
    if let Some(addr) = parse_env::<IpAddr>(env, "RELAY_LISTEN_ADDR")? {
        file.proxy.listen_addr = addr;
    }
    if let Some(ms) = parse_env::<u64>(env, "RELAY_CONNECT_TIMEOUT_MS")? {
        file.proxy.connect_timeout_ms = ms;
    }
    if let Some(secs) = parse_env::<u64>(env, "RELAY_IDLE_TIMEOUT_SECS")? {
        file.proxy.idle_timeout_secs = Some(secs);
    }
    if let Some(max) = parse_env::<usize>(env, "RELAY_MAX_CONNECTIONS")? {
        file.proxy.max_connections = max;
    }
    if let Some(url) = env("RELAY_KUBE_API_URL") {
        file.kube.api_url = Some(url);
    }
    if let Some(path) = env("RELAY_KUBE_TOKEN_FILE") {
        file.kube.token_file = Some(PathBuf::from(path));
    }
    if let Some(path) = env("RELAY_KUBE_CA_FILE") {
        file.kube.ca_file = Some(PathBuf::from(path));
    }
    Ok(())
}

fn kube_api_config(
    section: &KubeSection,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<KubeApiConfig> {
    let mut config = match &section.api_url {
        Some(url) => KubeApiConfig {
            api_url: url.clone(),
            token_file: None,
            ca_file: None,
        },
        None => match (
            env("KUBERNETES_SERVICE_HOST"),
            env("KUBERNETES_SERVICE_PORT"),
        ) {
            (Some(host), Some(port)) => KubeApiConfig::in_cluster(&host, &port),
            _ => bail!(
                "No Kubernetes API configured. Set RELAY_KUBE_API_URL or run in-cluster \
                 (KUBERNETES_SERVICE_HOST/KUBERNETES_SERVICE_PORT)."
            ),
        },
    };

    if section.token_file.is_some() {
        config.token_file = section.token_file.clone();
    }
    if section.ca_file.is_some() {
        config.ca_file = section.ca_file.clone();
    }

    Ok(config)
}
