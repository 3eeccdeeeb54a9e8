use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
clusters:
  sessions:
    servers:
      - cache-1.example.com:11211
      - cache-2.example.com
    max_size: 12
    freshness_window: 120
    blacklist_ttl: 30
    max_retries: 4
    max_connect_retries: 2
    reconnect_delay_ms: 250
    checkout_timeout: 5
    default_expiry: 3600
  objects:
    servers:
      - cache-3.example.com:11212

default_cluster: sessions
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("memcpool.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = memcpool::config::load_from_yaml(&config_path).unwrap();

    assert_eq!(config.clusters.len(), 2);
    assert_eq!(config.default_cluster, Some("sessions".to_string()));

    let cluster = config.get_cluster(None).unwrap();
    assert_eq!(cluster.servers.len(), 2);
    assert_eq!(cluster.max_size, 12);
    assert_eq!(cluster.default_expiry(), Duration::from_secs(3600));

    let pool = cluster.pool_config();
    assert_eq!(pool.max_size, Some(12));
    assert_eq!(pool.freshness_window, Duration::from_secs(120));
    assert_eq!(pool.checkout_timeout, Duration::from_secs(5));
    assert_eq!(pool.retry.max_retries, 4);
    assert_eq!(pool.retry.max_connect_retries, 2);
    assert_eq!(pool.retry.reconnect_delay, Duration::from_millis(250));

    let objects = config.get_cluster(Some("objects")).unwrap();
    assert_eq!(objects.addresses().unwrap()[0].as_str(), "cache-3.example.com:11212");
    assert_eq!(objects.max_size, 35);
}

/// Test loading configuration from environment variables
#[test]
fn test_load_env_config() {
    let vars = [
        "MEMCACHE_SERVERS",
        "MEMCACHE_POOL_SIZE",
        "MEMCACHE_BLACKLIST_TTL",
        "MEMCACHE_MAX_RETRIES",
    ];
    let saved: Vec<_> = vars.iter().map(|v| env::var(v).ok()).collect();

    env::set_var("MEMCACHE_SERVERS", "cache-1:11211, cache-2:11211,,cache-3");
    env::set_var("MEMCACHE_POOL_SIZE", "8");
    env::set_var("MEMCACHE_BLACKLIST_TTL", "15");
    env::set_var("MEMCACHE_MAX_RETRIES", "not-a-number");

    let config = memcpool::config::load_from_env().unwrap();

    assert_eq!(config.clusters.len(), 1);
    assert_eq!(config.default_cluster, Some("default".to_string()));

    let cluster = config.get_cluster(None).unwrap();
    assert_eq!(cluster.servers, vec!["cache-1:11211", "cache-2:11211", "cache-3"]);
    assert_eq!(cluster.max_size, 8);
    assert_eq!(cluster.blacklist_ttl(), Duration::from_secs(15));
    // Unparseable values keep the default
    assert_eq!(cluster.max_retries, 3);

    env::set_var("MEMCACHE_SERVERS", " , ");
    assert!(memcpool::config::load_from_env().is_err());

    env::remove_var("MEMCACHE_SERVERS");
    assert!(memcpool::config::load_from_env().is_err());

    for (var, value) in vars.iter().zip(saved) {
        match value {
            Some(v) => env::set_var(var, v),
            None => env::remove_var(var),
        }
    }
}

/// Test that invalid settings are rejected when loading
#[test]
fn test_invalid_yaml_rejected() {
    let temp_dir = TempDir::new().unwrap();

    let no_servers = temp_dir.path().join("empty.yaml");
    fs::write(&no_servers, "clusters:\n  main:\n    servers: []\n").unwrap();
    assert!(memcpool::config::load_from_yaml(&no_servers).is_err());

    let bad_port = temp_dir.path().join("port.yaml");
    fs::write(&bad_port, "clusters:\n  main:\n    servers: [\"cache-1:99999\"]\n").unwrap();
    assert!(memcpool::config::load_from_yaml(&bad_port).is_err());

    let instant_connect = temp_dir.path().join("connect.yaml");
    fs::write(&instant_connect, "clusters:\n  main:\n    servers: [cache-1]\n    connect_timeout: 0\n").unwrap();
    assert!(memcpool::config::load_from_yaml(&instant_connect).is_err());

    let malformed = temp_dir.path().join("bad.yaml");
    fs::write(&malformed, "clusters: [not, a, map").unwrap();
    assert!(memcpool::config::load_from_yaml(&malformed).is_err());

    assert!(memcpool::config::load_from_yaml(temp_dir.path().join("missing.yaml")).is_err());
}

/// Test cluster selection through load_config
#[test]
fn test_load_config_selects_cluster() {
    let yaml = r#"
clusters:
  primary:
    servers: [cache-1]
  secondary:
    servers: [cache-2]
default_cluster: primary
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("memcpool.yaml");
    fs::write(&config_path, yaml).unwrap();
    let path = config_path.to_str().unwrap();

    let config = memcpool::config::load_config(Some(path), Some("secondary")).unwrap();
    assert_eq!(config.default_cluster, Some("secondary".to_string()));
    assert_eq!(config.get_cluster(None).unwrap().servers, vec!["cache-2"]);

    assert!(memcpool::config::load_config(Some(path), Some("tertiary")).is_err());
}
