//! Agent configuration.
//!
//! Settings are read from TOML (see [`crate::cli::ConfigDiscovery`] for the
//! lookup order) and can be overridden per setting through environment
//! variables listed in [`crate::env::vars`].

use crate::compute::ComputeConfig;
use crate::delegate::{DelegateConfig, TunnelVariant};
use crate::env::{self, vars};
use crate::runtime::DockerRuntimeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level agent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent home; holds event scripts and the host uuid file.
    pub home: PathBuf,
    /// Maximum number of events handled concurrently.
    pub workers: usize,
    /// Seconds graceful stop is retried before a container is killed.
    pub stop_timeout_secs: u64,
    /// Reported host name; the system host name when unset.
    pub hostname: Option<String>,
    /// Reported physical host uuid; the compute host uuid when unset.
    pub physical_host_uuid: Option<String>,
    pub docker: DockerConfig,
    pub delegate: DelegateConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(env::DEFAULT_HOME),
            workers: 50,
            stop_timeout_secs: 60,
            hostname: None,
            physical_host_uuid: None,
            docker: DockerConfig::default(),
            delegate: DelegateConfig::default(),
        }
    }
}

/// Container engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub enabled: bool,
    /// Engine url; local defaults when unset.
    pub url: Option<String>,
    pub api_version: Option<String>,
    /// Address reported for this host; detected when unset.
    pub host_ip: Option<String>,
    /// Fixed compute host uuid; read from `uuid_file` when unset.
    pub uuid: Option<String>,
    /// Defaults to `<home>/.docker_uuid`.
    pub uuid_file: Option<PathBuf>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            api_version: None,
            host_ip: None,
            uuid: None,
            uuid_file: None,
            timeout_secs: 60,
        }
    }
}

impl AgentConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its
    /// value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for values that do not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup(vars::HOME) {
            self.home = PathBuf::from(home);
        }
        if let Some(workers) = lookup(vars::WORKERS) {
            self.workers = parse(vars::WORKERS, &workers)?;
        }
        if let Some(timeout) = lookup(vars::STOP_TIMEOUT) {
            self.stop_timeout_secs = parse(vars::STOP_TIMEOUT, &timeout)?;
        }
        if let Some(url) = lookup(vars::CONFIG_URL) {
            self.delegate.config_url = Some(url);
        }
        if let Some(hostname) = lookup(vars::HOSTNAME) {
            self.hostname = Some(hostname);
        }
        if let Some(uuid) = lookup(vars::PHYSICAL_HOST_UUID) {
            self.physical_host_uuid = Some(uuid);
        }
        if let Some(enabled) = lookup(vars::DOCKER_ENABLED) {
            self.docker.enabled = enabled == "true";
        }
        if let Some(url) = lookup(vars::DOCKER_URL_BASE) {
            self.docker.url = Some(url);
        }
        if let Some(version) = lookup(vars::DOCKER_API_VERSION) {
            self.docker.api_version = Some(version);
        }
        if let Some(ip) = lookup(vars::DOCKER_HOST_IP) {
            self.docker.host_ip = Some(ip);
        }
        if let Some(uuid) = lookup(vars::DOCKER_UUID) {
            self.docker.uuid = Some(uuid);
        }
        if let Some(path) = lookup(vars::DOCKER_UUID_FILE) {
            self.docker.uuid_file = Some(PathBuf::from(path));
        }
        if let Some(timeout) = lookup(vars::DOCKER_TIMEOUT) {
            self.docker.timeout_secs = parse(vars::DOCKER_TIMEOUT, &timeout)?;
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn uuid_file(&self) -> PathBuf {
        self.docker
            .uuid_file
            .clone()
            .unwrap_or_else(|| env::uuid_file_path(&self.home))
    }

    pub fn tunnel(&self) -> TunnelVariant {
        self.delegate.tunnel
    }

    pub fn runtime_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            url: self.docker.url.clone(),
            api_version: self.docker.api_version.clone(),
            timeout: self.docker.timeout_secs,
        }
    }

    pub fn compute_config(&self) -> ComputeConfig {
        ComputeConfig {
            stop_timeout: self.stop_timeout(),
            host_ip: self.host_ip(),
        }
    }

    /// Reported host name.
    pub fn hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(system_hostname)
    }

    /// Reported host address.
    pub fn host_ip(&self) -> String {
        self.docker.host_ip.clone().unwrap_or_else(detect_host_ip)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn system_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Address of the interface used for outbound traffic. Connecting a UDP
/// socket sends nothing.
fn detect_host_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
