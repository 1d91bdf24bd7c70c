//! File configuration for proxies and the command line tool
//!
//! Every field has a default, so a missing file or a partial one is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    BUS_SOCKET_PREFIX, DEFAULT_DISCOVERY_ATTEMPTS, DEFAULT_DISCOVERY_DELAY_MS,
    DEFAULT_DISCOVERY_TIME_LIMIT_MS, DEFAULT_TIME_LIMIT_SECS,
};
use crate::proxy::DiscoveryConfig;

/// Places searched when no config file is given explicitly
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["actor-proxy.json", "config/actor-proxy.json"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Prefix of the bus socket file; `${VAR}` is read from the environment
    pub socket_prefix: String,

    /// Default time limit of a command; 0 waits forever
    pub time_limit_secs: u64,

    pub discovery: DiscoverySettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_prefix: BUS_SOCKET_PREFIX.to_string(),
            time_limit_secs: DEFAULT_TIME_LIMIT_SECS,
            discovery: DiscoverySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub attempts: u32,
    pub delay_ms: u64,
    pub time_limit_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_DISCOVERY_ATTEMPTS,
            delay_ms: DEFAULT_DISCOVERY_DELAY_MS,
            time_limit_ms: DEFAULT_DISCOVERY_TIME_LIMIT_MS,
        }
    }
}

impl From<&DiscoverySettings> for DiscoveryConfig {
    fn from(settings: &DiscoverySettings) -> Self {
        Self {
            attempts: settings.attempts,
            delay: Duration::from_millis(settings.delay_ms),
            time_limit: Duration::from_millis(settings.time_limit_ms),
        }
    }
}

impl ProxyConfig {
    /// Read `path`, or the first default location that exists.
    ///
    /// An explicit path must exist; otherwise no file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => {
                    debug!("no config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: ProxyConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.socket_prefix = expand_env_var(&config.socket_prefix);
        debug!("loaded config from {}: {config:?}", path.display());
        Ok(config)
    }

    /// `None` waits forever.
    pub fn time_limit(&self) -> Option<Duration> {
        (self.time_limit_secs > 0).then(|| Duration::from_secs(self.time_limit_secs))
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig::from(&self.discovery)
    }
}

fn default_config_path() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// `${NAME}` becomes the value of `NAME`; anything else is kept as is.
fn expand_env_var(value: &str) -> String {
    let Some(name) = value.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
        return value.to_string();
    };
    std::env::var(name).unwrap_or_else(|_| {
        warn!("environment variable '{name}' not found, using default socket prefix");
        BUS_SOCKET_PREFIX.to_string()
    })
}
