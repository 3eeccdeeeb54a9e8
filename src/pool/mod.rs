//! Connection pooling and failover module
//!
//! This module provides:
//! - A blocking connection pool with freshness-based eviction
//! - Connection establishment that blacklists unreachable servers
//! - Clients that rebuild their connection and retry on transport failure
//!
//! ```rust,no_run
//! use memcpool::lb::{parse_addresses, ServerSelector};
//! use memcpool::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
//! use memcpool::protocol::TextConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let servers = parse_addresses(["cache-1:11211", "cache-2:11211"])?;
//! let selector = Arc::new(ServerSelector::new(servers, Duration::from_secs(60)));
//! let factory = Arc::new(ConnectionFactory::new(
//!     TextConnector::default(),
//!     selector,
//!     Duration::from_secs(4),
//! ));
//! let pool = ConnectionPool::new(factory, PoolConfig::default());
//!
//! let mut conn = pool.reserve()?;
//! conn.set("greeting", b"hello", 0, 0)?;
//! let item = conn.get("greeting")?;
//! // `conn` goes back to the pool here
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod factory;
pub mod resilient;

pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use factory::ConnectionFactory;
pub use resilient::{ResilientClient, RetryPolicy};
