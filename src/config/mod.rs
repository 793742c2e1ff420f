//! Configuration management for hopscope
//!
//! Configuration is read from a TOML file (every section optional) and then
//! overridden by `HOPSCOPE_SECTION__KEY` environment variables.

use crate::error::{HopscopeError, Result};
use crate::pipeline::PublishMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub broker: BrokerConfig,
    pub tracer: TracerConfig,
    pub geo: GeoConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Message broker connection and queue names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Host (or full `amqp://` URI)
    pub host: String,
    pub inbound_queue: String,
    pub outbound_queue: String,
    /// Unacknowledged message limit; unlimited when unset
    pub prefetch: Option<u16>,
}

impl BrokerConfig {
    pub fn uri(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("amqp://{}", self.host)
        }
    }
}

/// Hop discovery tool invocation: `<command> <flags...> <destination>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub command: String,
    pub flags: Vec<String>,
    /// Kill traces running longer than this (e.g. "60s"); no limit when unset
    pub timeout: Option<String>,
}

/// Geolocation API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is unset
    pub api_key_env: String,
    pub request_timeout: String,
}

impl GeoConfig {
    /// Configured key, falling back to the key environment variable
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// Persistent geolocation store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// In-memory cache limits; unset means unbounded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_addresses: Option<usize>,
    pub address_ttl: Option<String>,
    pub max_flows: Option<usize>,
    pub flow_ttl: Option<String>,
}

/// Publishing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub publish_mode: PublishMode,
    /// Upper bound on waiting for a trace in `await-trace` mode
    pub publish_wait: String,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HopscopeError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| HopscopeError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| HopscopeError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: HOPSCOPE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("HOPSCOPE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "BROKER__HOST" => self.broker.host = value.to_string(),
            "BROKER__INBOUND_QUEUE" => self.broker.inbound_queue = value.to_string(),
            "BROKER__OUTBOUND_QUEUE" => self.broker.outbound_queue = value.to_string(),
            "BROKER__PREFETCH" => {
                self.broker.prefetch = Some(value.parse().map_err(|_| {
                    HopscopeError::InvalidConfigValue {
                        path: path.to_string(),
                        message: format!("Cannot parse '{}' as a message count", value),
                    }
                })?);
            }
            "TRACER__COMMAND" => self.tracer.command = value.to_string(),
            "TRACER__FLAGS" => {
                self.tracer.flags = value.split_whitespace().map(str::to_string).collect();
            }
            "TRACER__TIMEOUT" => self.tracer.timeout = Some(value.to_string()),
            "GEO__API_URL" => self.geo.api_url = value.to_string(),
            "GEO__API_KEY" => self.geo.api_key = Some(value.to_string()),
            "STORE__PATH" => self.store.path = PathBuf::from(value),
            "PIPELINE__PUBLISH_MODE" => {
                self.pipeline.publish_mode = match value {
                    "snapshot" => PublishMode::Snapshot,
                    "await-trace" => PublishMode::AwaitTrace,
                    _ => {
                        return Err(HopscopeError::InvalidConfigValue {
                            path: path.to_string(),
                            message: format!(
                                "Unknown publish mode '{}' (expected snapshot or await-trace)",
                                value
                            ),
                        })
                    }
                };
            }
            "PIPELINE__PUBLISH_WAIT" => self.pipeline.publish_wait = value.to_string(),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Trace timeout, if any
    pub fn tracer_timeout(&self) -> Option<Duration> {
        self.tracer.timeout.as_deref().and_then(parse_duration)
    }

    pub fn geo_request_timeout(&self) -> Duration {
        parse_duration(&self.geo.request_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn publish_wait(&self) -> Duration {
        parse_duration(&self.pipeline.publish_wait).unwrap_or(Duration::from_secs(30))
    }

    pub fn address_ttl(&self) -> Option<Duration> {
        self.cache.address_ttl.as_deref().and_then(parse_duration)
    }

    pub fn flow_ttl(&self) -> Option<Duration> {
        self.cache.flow_ttl.as_deref().and_then(parse_duration)
    }

    /// Store path with `~` expanded
    pub fn store_path(&self) -> PathBuf {
        expand_tilde(&self.store.path)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            HopscopeError::Config("Cannot determine config directory".to_string())
        })?;

        Ok(config_dir.join("hopscope").join("config.toml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig::default(),
            broker: BrokerConfig::default(),
            tracer: TracerConfig::default(),
            geo: GeoConfig::default(),
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_at: current_timestamp(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            inbound_queue: "ipaddress".to_string(),
            outbound_queue: "ipaddressArgumented".to_string(),
            prefetch: None,
        }
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            command: "traceroute".to_string(),
            flags: vec!["-n".to_string()],
            timeout: None,
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            api_url: "http://api.ipstack.com/".to_string(),
            api_key: None,
            api_key_env: "IPSTACK_KEY".to_string(),
            request_timeout: "10s".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.hopscope/geolocations.sqlite"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_mode: PublishMode::Snapshot,
            publish_wait: "30s".to_string(),
        }
    }
}

/// Parse a duration string such as "500ms", "30s", "5m" or a bare number of seconds
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();

    // Check "ms" before "s" because "ms" ends with "s"
    if let Some(ms) = value.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = value.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = value.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        value.parse().ok().map(Duration::from_secs)
    }
}

/// Expand tilde in path
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
