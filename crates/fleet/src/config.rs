//! Daemon configuration
//!
//! Layered with the `config` crate: an optional file (path from
//! `HOLLOW_FLEET_CONFIG`), then environment variables prefixed with `FLEET_`
//! using `__` for nesting, e.g. `FLEET_API_PORT=8080` or
//! `FLEET_FLEET__FLEET_SIZE=500`.

use anyhow::{Context, Result};
use fleet_lib::control_plane::ClientConfig;
use fleet_lib::FleetConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "HOLLOW_FLEET_CONFIG";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// API server port for health, metrics and placements
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub fleet: FleetConfig,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlPlaneKind {
    /// Remote control plane over gRPC
    Grpc,
    /// In-process control plane for dry runs
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_kind")]
    pub kind: ControlPlaneKind,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_kind() -> ControlPlaneKind {
    ControlPlaneKind::Grpc
}

fn default_endpoint() -> String {
    "http://control-plane:9090".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            endpoint: default_endpoint(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            connect_timeout_seconds: default_connect_timeout(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_seconds),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            ..ClientConfig::default()
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("FLEET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let daemon: DaemonConfig = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        daemon
            .fleet
            .validate()
            .context("Invalid fleet configuration")?;
        Ok(daemon)
    }
}
