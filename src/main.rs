use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use memcpool::cache::Cache;
use memcpool::cli::commands;
use memcpool::config::{self, PoolSettings};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memcpool")]
#[command(version, about = "Resilient pooled memcached client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Cluster to use from config
    #[arg(long, global = true)]
    cluster: Option<String>,

    /// Comma-separated servers, overriding config and environment
    #[arg(long, global = true, value_delimiter = ',')]
    servers: Option<Vec<String>>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a value
    Get {
        key: String,
    },

    /// Store a value
    Set {
        key: String,

        /// Value to store (read from stdin if omitted)
        value: Option<String>,

        /// Expiry in seconds (0 = never)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key
    Delete {
        key: String,
    },

    /// Increment a counter
    Incr {
        key: String,

        #[arg(long, default_value = "1")]
        by: u64,
    },

    /// Decrement a counter
    Decr {
        key: String,

        #[arg(long, default_value = "1")]
        by: u64,
    },

    /// Reset the expiry of a key
    Touch {
        key: String,

        /// New expiry in seconds
        #[arg(long)]
        ttl: u64,
    },

    /// Show server and pool statistics
    Stats,

    /// Invalidate all items
    Flush {
        /// Required, since this empties the server
        #[arg(long)]
        force: bool,
    },

    /// Show server version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let settings = resolve_settings(&cli)?;
    debug!(servers = ?settings.servers, max_size = settings.max_size, "Using cache settings");

    let cache = Cache::from_settings(&settings).context("Failed to initialise cache pool")?;

    match cli.command {
        Commands::Get { key } => commands::cmd_get(&cache, &key)?,
        Commands::Set { key, value, ttl } => {
            commands::cmd_set(&cache, &key, value.as_deref(), ttl)?;
        }
        Commands::Delete { key } => commands::cmd_delete(&cache, &key)?,
        Commands::Incr { key, by } => commands::cmd_incr(&cache, &key, by)?,
        Commands::Decr { key, by } => commands::cmd_decr(&cache, &key, by)?,
        Commands::Touch { key, ttl } => commands::cmd_touch(&cache, &key, ttl)?,
        Commands::Stats => commands::cmd_stats(&cache)?,
        Commands::Flush { force } => commands::cmd_flush(&cache, force)?,
        Commands::Version => commands::cmd_version(&cache)?,
    }

    Ok(())
}

/// Pick settings: --servers, then the config file, then the environment,
/// then a local server with defaults
fn resolve_settings(cli: &Cli) -> Result<PoolSettings> {
    if let Some(servers) = &cli.servers {
        return Ok(PoolSettings {
            servers: servers.clone(),
            ..PoolSettings::default()
        });
    }

    if cli.config.is_none() && std::env::var_os("MEMCACHE_SERVERS").is_none() {
        debug!("No configuration given, using local defaults");
        return Ok(PoolSettings::default());
    }

    let config = config::load_config(cli.config.as_deref(), cli.cluster.as_deref())?;
    config
        .get_cluster(cli.cluster.as_deref())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No cluster found in configuration"))
}
