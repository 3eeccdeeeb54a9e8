use crate::lb::{parse_addresses, Address};
use crate::pool::{PoolConfig, RetryPolicy};
use crate::protocol::text::{TextConnector, DEFAULT_MAX_ITEM_SIZE};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Settings for one group of cache servers sharing a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Server addresses (`host:port`, port defaults to 11211)
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Pool capacity (0 = unbounded, checkout never waits)
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Seconds a connection may be reused before it is replaced
    #[serde(default = "default_freshness_window")]
    pub freshness_window: u64,

    /// Seconds allowed for a single connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Socket read/write timeout in seconds (0 = none)
    #[serde(default = "default_io_timeout")]
    pub io_timeout: u64,

    /// Seconds an unreachable server stays blacklisted
    #[serde(default = "default_blacklist_ttl")]
    pub blacklist_ttl: u64,

    /// Attempts per retryable operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Attempts when rebuilding a broken connection
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,

    /// Initial reconnect backoff in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Seconds a checkout waits on a full pool
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout: u64,

    /// Expiry in seconds used when a write does not give one (0 = never)
    #[serde(default)]
    pub default_expiry: u64,

    /// Largest value in bytes the client will send
    #[serde(default = "default_max_item_size")]
    pub max_item_size: usize,
}

fn default_servers() -> Vec<String> {
    vec!["127.0.0.1:11211".to_string()]
}

fn default_max_size() -> usize {
    35
}

fn default_freshness_window() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    4
}

fn default_io_timeout() -> u64 {
    4
}

fn default_blacklist_ttl() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_connect_retries() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

fn default_checkout_timeout() -> u64 {
    10
}

fn default_max_item_size() -> usize {
    DEFAULT_MAX_ITEM_SIZE
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            max_size: default_max_size(),
            freshness_window: default_freshness_window(),
            connect_timeout: default_connect_timeout(),
            io_timeout: default_io_timeout(),
            blacklist_ttl: default_blacklist_ttl(),
            max_retries: default_max_retries(),
            max_connect_retries: default_max_connect_retries(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            checkout_timeout: default_checkout_timeout(),
            default_expiry: 0,
            max_item_size: default_max_item_size(),
        }
    }
}

impl PoolSettings {
    /// Check the settings for values the pool cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("At least one cache server must be configured");
        }
        if self.checkout_timeout == 0 {
            anyhow::bail!("checkout_timeout must be greater than zero");
        }
        if self.connect_timeout == 0 {
            anyhow::bail!("connect_timeout must be greater than zero");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries must be at least 1");
        }
        self.addresses()?;
        Ok(())
    }

    /// Parsed server addresses
    pub fn addresses(&self) -> Result<Vec<Address>> {
        parse_addresses(&self.servers).context("Invalid cache server address")
    }

    pub fn blacklist_ttl(&self) -> Duration {
        Duration::from_secs(self.blacklist_ttl)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn default_expiry(&self) -> Duration {
        Duration::from_secs(self.default_expiry)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_connect_retries: self.max_connect_retries,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: (self.max_size > 0).then_some(self.max_size),
            freshness_window: Duration::from_secs(self.freshness_window),
            checkout_timeout: Duration::from_secs(self.checkout_timeout),
            retry: self.retry_policy(),
        }
    }

    /// Text protocol connector carrying the socket settings
    pub fn connector(&self) -> TextConnector {
        TextConnector {
            io_timeout: (self.io_timeout > 0).then(|| Duration::from_secs(self.io_timeout)),
            max_item_size: self.max_item_size,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Named server groups, one pool each
    #[serde(default)]
    pub clusters: HashMap<String, PoolSettings>,

    /// Cluster used when none is named
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cluster: Option<String>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a cluster by name, or the default cluster if not specified
    pub fn get_cluster(&self, name: Option<&str>) -> Option<&PoolSettings> {
        if let Some(name) = name {
            self.clusters.get(name)
        } else if let Some(default) = &self.default_cluster {
            self.clusters.get(default)
        } else {
            self.clusters.values().next()
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    for (name, cluster) in &config.clusters {
        cluster
            .validate()
            .with_context(|| format!("Invalid settings for cluster '{}'", name))?;
    }

    Ok(config)
}

/// Load configuration from environment variables
///
/// Builds a single `default` cluster from:
/// - MEMCACHE_SERVERS (comma-separated list of servers, required)
/// - MEMCACHE_POOL_SIZE
/// - MEMCACHE_FRESHNESS_WINDOW
/// - MEMCACHE_CONNECT_TIMEOUT
/// - MEMCACHE_BLACKLIST_TTL
/// - MEMCACHE_MAX_RETRIES
/// - MEMCACHE_MAX_CONNECT_RETRIES
/// - MEMCACHE_RECONNECT_DELAY_MS
/// - MEMCACHE_CHECKOUT_TIMEOUT
/// - MEMCACHE_DEFAULT_EXPIRY
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let servers_str =
        std::env::var("MEMCACHE_SERVERS").context("MEMCACHE_SERVERS environment variable not set")?;

    let servers: Vec<String> = servers_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if servers.is_empty() {
        anyhow::bail!("MEMCACHE_SERVERS contains no valid servers");
    }

    let mut cluster = PoolSettings {
        servers,
        ..PoolSettings::default()
    };

    env_override("MEMCACHE_POOL_SIZE", &mut cluster.max_size);
    env_override("MEMCACHE_FRESHNESS_WINDOW", &mut cluster.freshness_window);
    env_override("MEMCACHE_CONNECT_TIMEOUT", &mut cluster.connect_timeout);
    env_override("MEMCACHE_BLACKLIST_TTL", &mut cluster.blacklist_ttl);
    env_override("MEMCACHE_MAX_RETRIES", &mut cluster.max_retries);
    env_override("MEMCACHE_MAX_CONNECT_RETRIES", &mut cluster.max_connect_retries);
    env_override("MEMCACHE_RECONNECT_DELAY_MS", &mut cluster.reconnect_delay_ms);
    env_override("MEMCACHE_CHECKOUT_TIMEOUT", &mut cluster.checkout_timeout);
    env_override("MEMCACHE_DEFAULT_EXPIRY", &mut cluster.default_expiry);

    cluster.validate().context("Invalid cache settings in environment")?;

    let mut config = Config::new();
    config.clusters.insert("default".to_string(), cluster);
    config.default_cluster = Some("default".to_string());

    Ok(config)
}

/// Load configuration from file or environment
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `cluster_name` - Optional cluster to use (only relevant for YAML configs)
pub fn load_config(config_path: Option<&str>, cluster_name: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        let mut config = load_from_yaml(path)?;

        // If a specific cluster is requested, make it the default
        if let Some(name) = cluster_name {
            if !config.clusters.contains_key(name) {
                anyhow::bail!("Cluster '{}' not found in config file", name);
            }
            config.default_cluster = Some(name.to_string());
        }

        Ok(config)
    } else {
        load_from_env()
    }
}

fn env_override<T: FromStr>(name: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse() {
            Ok(val) => *field = val,
            Err(_) => warn!(var = name, value = %raw, "Ignoring unparseable environment variable"),
        }
    }
}
