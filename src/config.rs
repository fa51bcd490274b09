//! Configuration file model
//!
//! The controller is configured from a single TOML file. Only `[api]` is
//! required; every other section falls back to defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub dns: DnsSettings,
    #[serde(default)]
    pub cert: CertConfig,
    #[serde(default)]
    pub rest_api: RestApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.host.trim().is_empty() {
            return Err(Error::ConfigError("api.host must not be empty".to_string()));
        }
        if self.api.key.is_empty() {
            return Err(Error::ConfigError("api.key must not be empty".to_string()));
        }
        if self.api.timeout_secs == 0 {
            return Err(Error::ConfigError("api.timeout_secs must be > 0".to_string()));
        }
        if self.controller.update_interval_secs == 0 {
            return Err(Error::ConfigError(
                "controller.update_interval_secs must be > 0".to_string(),
            ));
        }
        if self.controller.report_interval_secs == Some(0)
            || self.controller.cert_check_interval_secs == Some(0)
        {
            return Err(Error::ConfigError(
                "controller intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Control-plane connection settings
#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub node_id: u32,
    pub key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Keeps the key out of logs
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("node_id", &self.node_id)
            .field("key", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_timeout_secs() -> u64 {
    10
}

/// Scheduling and binding defaults for the controller
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Reconciliation cadence; also the startup grace period before the
    /// first cycle may run
    pub update_interval_secs: u64,
    /// Traffic/status report cadence, defaults to the update interval
    pub report_interval_secs: Option<u64>,
    /// Certificate check cadence, defaults to 60x the update interval
    pub cert_check_interval_secs: Option<u64>,
    /// Listen address used when the node descriptor leaves it empty
    pub listen_ip: String,
    /// Source address for direct outbounds when the descriptor leaves it empty
    pub send_ip: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            report_interval_secs: None,
            cert_check_interval_secs: None,
            listen_ip: "0.0.0.0".to_string(),
            send_ip: "0.0.0.0".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(
            self.report_interval_secs
                .unwrap_or(self.update_interval_secs),
        )
    }

    pub fn cert_check_interval(&self) -> Duration {
        Duration::from_secs(
            self.cert_check_interval_secs
                .unwrap_or(self.update_interval_secs * 60),
        )
    }
}

/// Local resolver settings; remote name servers from the node are appended
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub servers: Vec<String>,
    pub hosts: BTreeMap<String, String>,
    pub client_ip: Option<String>,
    pub tag: Option<String>,
    pub query_strategy: Option<String>,
    pub disable_cache: bool,
    pub disable_fallback: bool,
    pub disable_fallback_if_match: bool,
}

/// Certificate storage for locally issued certificates
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    pub dir: PathBuf,
    pub renew_before_days: i64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/fleet-controller/cert"),
            renew_before_days: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RestApiConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
