//! memcpool - Resilient pooled memcached client
//!
//! Connections are checked out of a bounded pool, opened against whichever
//! server is currently reachable, and rebuilt transparently when the
//! transport fails mid-operation.

pub mod cache;
pub mod cli;
pub mod config;
pub mod lb;
pub mod pool;
pub mod protocol;

pub use cache::{Cache, CacheError};
pub use config::{Config, PoolSettings};
pub use lb::{Address, ServerSelector};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolError, PooledConnection, ResilientClient};
pub use protocol::{Connection, Connector, ProtocolError, TextConnector};
