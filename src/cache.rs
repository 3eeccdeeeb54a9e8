//! High-level cache API over a connection pool
//!
//! [`Cache`] checks a connection out for every call and returns it as soon
//! as the call finishes. Values are raw bytes; callers own serialization.

use crate::config::PoolSettings;
use crate::lb::ServerSelector;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolError};
use crate::protocol::{Connector, ProtocolError, TextConnector};
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Expiry values above this many seconds are read by the server as a
/// unix timestamp instead of a relative offset
const MAX_RELATIVE_EXPIRY: u64 = 60 * 60 * 24 * 30;

/// Error types for cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Key not found: {0}")]
    NotFound(String),
}

/// Pooled cache client
///
/// Cheap to clone; clones share the pool.
pub struct Cache<C: Connector = TextConnector> {
    pool: ConnectionPool<C>,
    default_expiry: Duration,
}

impl<C: Connector> Clone for Cache<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            default_expiry: self.default_expiry,
        }
    }
}

impl Cache<TextConnector> {
    /// Build the selector, factory and pool described by `settings`
    pub fn from_settings(settings: &PoolSettings) -> Result<Self> {
        settings.validate()?;

        let selector = Arc::new(ServerSelector::new(
            settings.addresses()?,
            settings.blacklist_ttl(),
        ));
        let factory = Arc::new(ConnectionFactory::new(
            settings.connector(),
            selector,
            settings.connect_timeout(),
        ));
        let pool = ConnectionPool::new(factory, settings.pool_config());

        Ok(Self::new(pool, settings.default_expiry()))
    }
}

impl<C: Connector> Cache<C> {
    /// Wrap an existing pool
    ///
    /// `default_expiry` applies to writes that pass no expiry; zero means
    /// items never expire.
    pub fn new(pool: ConnectionPool<C>, default_expiry: Duration) -> Self {
        Self {
            pool,
            default_expiry,
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Fetch a value, `None` if the key is missing
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.pool.reserve()?;
        Ok(conn.get(key)?.map(|item| item.value))
    }

    /// Fetch a value, falling back to `default` if the key is missing
    pub fn get_or(&self, key: &str, default: impl Into<Bytes>) -> Result<Bytes, CacheError> {
        Ok(self.get(key)?.unwrap_or_else(|| default.into()))
    }

    /// Store a value unconditionally
    pub fn set(&self, key: &str, value: &[u8], expiry: Option<Duration>) -> Result<bool, CacheError> {
        let exptime = self.exptime(expiry);
        let mut conn = self.pool.reserve()?;
        Ok(conn.set(key, value, 0, exptime)?)
    }

    /// Store a value only if the key is not present; `false` if it was
    pub fn add(&self, key: &str, value: &[u8], expiry: Option<Duration>) -> Result<bool, CacheError> {
        let exptime = self.exptime(expiry);
        let mut conn = self.pool.reserve()?;
        Ok(conn.add(key, value, 0, exptime)?)
    }

    /// Remove a key; `false` if it did not exist
    pub fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.pool.reserve()?;
        Ok(conn.delete(key)?)
    }

    /// Increment a numeric value, returning the new value
    pub fn incr(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        let mut conn = self.pool.reserve()?;
        let result = conn.incr(key, delta);
        counter_result(key, result)
    }

    /// Decrement a numeric value, returning the new value
    ///
    /// The server clamps at zero.
    pub fn decr(&self, key: &str, delta: u64) -> Result<u64, CacheError> {
        let mut conn = self.pool.reserve()?;
        let result = conn.decr(key, delta);
        counter_result(key, result)
    }

    /// Reset the expiry of an existing key; `false` if it did not exist
    pub fn touch(&self, key: &str, expiry: Option<Duration>) -> Result<bool, CacheError> {
        let exptime = self.exptime(expiry);
        let mut conn = self.pool.reserve()?;
        Ok(conn.touch(key, exptime)?)
    }

    /// Fetch several keys on one connection; missing keys are left out
    pub fn get_many(&self, keys: &[&str]) -> Result<HashMap<String, Bytes>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.pool.reserve()?;
        let items = conn.get_multi(keys)?;
        Ok(items
            .into_iter()
            .map(|(key, item)| (key, item.value))
            .collect())
    }

    /// Store several values on one connection
    ///
    /// Returns the keys the server declined to store.
    pub fn set_many(
        &self,
        items: &[(&str, &[u8])],
        expiry: Option<Duration>,
    ) -> Result<Vec<String>, CacheError> {
        let exptime = self.exptime(expiry);
        let mut conn = self.pool.reserve()?;

        let mut rejected = Vec::new();
        for (key, value) in items {
            if !conn.set(key, value, 0, exptime)? {
                rejected.push(key.to_string());
            }
        }

        if !rejected.is_empty() {
            debug!(count = rejected.len(), "Server declined some writes");
        }
        Ok(rejected)
    }

    /// Remove several keys on one connection; missing keys are ignored
    pub fn delete_many(&self, keys: &[&str]) -> Result<(), CacheError> {
        let mut conn = self.pool.reserve()?;
        for key in keys {
            conn.delete(key)?;
        }
        Ok(())
    }

    /// Invalidate every item on the server behind one pooled connection
    pub fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.reserve()?;
        conn.flush_all()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.pool.reserve()?;
        Ok(conn.stats()?)
    }

    pub fn version(&self) -> Result<String, CacheError> {
        let mut conn = self.pool.reserve()?;
        Ok(conn.version()?)
    }

    fn exptime(&self, expiry: Option<Duration>) -> u32 {
        to_exptime(expiry.unwrap_or(self.default_expiry), SystemTime::now())
    }
}

fn counter_result(key: &str, result: Result<Option<u64>, PoolError>) -> Result<u64, CacheError> {
    match result {
        Ok(Some(value)) => Ok(value),
        Ok(None) | Err(PoolError::Protocol(ProtocolError::KeyNotFound(_))) => {
            Err(CacheError::NotFound(key.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Convert an expiry into the server's `exptime` field
///
/// Long expiries are sent as an absolute unix timestamp.
fn to_exptime(expiry: Duration, now: SystemTime) -> u32 {
    let secs = expiry.as_secs();
    if secs <= MAX_RELATIVE_EXPIRY {
        return secs as u32;
    }

    let now = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    u32::try_from(now.saturating_add(secs)).unwrap_or(u32::MAX)
}
