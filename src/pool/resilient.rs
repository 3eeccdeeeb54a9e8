//! Transparent reconnect-and-retry around a single connection

use super::connection::PoolError;
use super::factory::ConnectionFactory;
use crate::lb::Address;
use crate::protocol::{CasResult, Connection, Connector, Item, ProtocolError, StoreMode, Verb};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounds on how hard a client works to recover from failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for one retryable operation
    pub max_retries: u32,

    /// Connection attempts when rebuilding a broken connection
    pub max_connect_retries: u32,

    /// First backoff delay; doubles between reconnects, triples between operation retries
    pub reconnect_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_connect_retries: 5,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// A connection that rebuilds itself when the transport fails
///
/// Retryable verbs (see [`Verb::is_retryable`]) that fail with an I/O or
/// protocol error have their connection discarded and rebuilt through the
/// [`ConnectionFactory`], then are re-issued. Other verbs run exactly once.
///
/// Non-idempotent verbs such as `incr` and `append` are retried too. A
/// mutation that reached the server before the connection dropped is then
/// applied twice.
pub struct ResilientClient<C: Connector> {
    conn: Option<C::Conn>,
    factory: Arc<ConnectionFactory<C>>,
    policy: RetryPolicy,
}

impl<C: Connector> ResilientClient<C> {
    /// Open a connection through `factory`
    ///
    /// A failure here is returned as is; reconnect backoff only applies to
    /// connections that already existed.
    pub fn connect(factory: Arc<ConnectionFactory<C>>, policy: RetryPolicy) -> Result<Self, PoolError> {
        let conn = factory.create()?;
        Ok(Self {
            conn: Some(conn),
            factory,
            policy,
        })
    }

    /// Server of the current connection, if there is one
    pub fn address(&self) -> Option<&Address> {
        self.conn.as_ref().map(|conn| conn.address())
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.is_connected())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Close and drop the current connection
    ///
    /// The next operation reconnects first.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }

    /// Throw the current connection away and open a new one
    ///
    /// Tries up to `max_connect_retries` times, doubling the delay after
    /// each failure. Each attempt goes through [`ConnectionFactory::create`],
    /// which builds a brand new client, so a client whose connect failed
    /// with [`ProtocolError::InvalidState`] is dropped rather than retried.
    pub fn reconnect(&mut self) -> Result<(), PoolError> {
        self.close();

        let attempts = self.policy.max_connect_retries.max(1);
        let mut delay = self.policy.reconnect_delay;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.factory.create() {
                Ok(conn) => {
                    debug!(addr = %conn.address(), attempt, "Reconnected");
                    self.conn = Some(conn);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reconnect attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(PoolError::NoServers))
    }

    /// Run `op` against the connection under the retry policy of `verb`
    pub fn execute<T, F>(&mut self, verb: Verb, mut op: F) -> Result<T, PoolError>
    where
        F: FnMut(&mut C::Conn) -> Result<T, ProtocolError>,
    {
        if !verb.is_retryable() {
            let result = op(self.connection()?);
            if matches!(&result, Err(err) if err.is_transport()) {
                self.close();
            }
            return result.map_err(PoolError::from);
        }

        let attempts = self.policy.max_retries.max(1);
        let mut delay = self.policy.reconnect_delay;
        let mut attempt = 1;

        loop {
            match op(self.connection()?) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(verb = %verb, attempt, "Operation succeeded after reconnect");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transport() => {
                    let addr = self.address().map(ToString::to_string).unwrap_or_default();
                    self.close();

                    if attempt >= attempts {
                        warn!(
                            verb = %verb,
                            addr = %addr,
                            attempts,
                            error = %err,
                            "Operation failed, retries exhausted"
                        );
                        return Err(err.into());
                    }

                    warn!(
                        verb = %verb,
                        addr = %addr,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transport failure, reconnecting"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(3);
                    self.reconnect()?;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn connection(&mut self) -> Result<&mut C::Conn, PoolError> {
        if self.conn.is_none() {
            self.reconnect()?;
        }
        self.conn.as_mut().ok_or(PoolError::NoServers)
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Item>, PoolError> {
        self.execute(Verb::Get, |conn| conn.get(key))
    }

    pub fn gets(&mut self, key: &str) -> Result<Option<Item>, PoolError> {
        self.execute(Verb::Gets, |conn| conn.gets(key))
    }

    pub fn get_multi(&mut self, keys: &[&str]) -> Result<HashMap<String, Item>, PoolError> {
        self.execute(Verb::GetMulti, |conn| conn.get_multi(keys))
    }

    pub fn set(&mut self, key: &str, value: &[u8], flags: u32, exptime: u32) -> Result<bool, PoolError> {
        self.store(StoreMode::Set, key, value, flags, exptime)
    }

    /// Store only if the key does not exist yet
    pub fn add(&mut self, key: &str, value: &[u8], flags: u32, exptime: u32) -> Result<bool, PoolError> {
        self.store(StoreMode::Add, key, value, flags, exptime)
    }

    /// Store only if the key already exists
    pub fn replace(&mut self, key: &str, value: &[u8], flags: u32, exptime: u32) -> Result<bool, PoolError> {
        self.store(StoreMode::Replace, key, value, flags, exptime)
    }

    pub fn append(&mut self, key: &str, value: &[u8]) -> Result<bool, PoolError> {
        self.store(StoreMode::Append, key, value, 0, 0)
    }

    pub fn prepend(&mut self, key: &str, value: &[u8]) -> Result<bool, PoolError> {
        self.store(StoreMode::Prepend, key, value, 0, 0)
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<bool, PoolError> {
        self.execute(mode.verb(), |conn| conn.store(mode, key, value, flags, exptime))
    }

    pub fn cas(
        &mut self,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
        cas: u64,
    ) -> Result<CasResult, PoolError> {
        self.execute(Verb::Cas, |conn| conn.cas(key, value, flags, exptime, cas))
    }

    pub fn delete(&mut self, key: &str) -> Result<bool, PoolError> {
        self.execute(Verb::Delete, |conn| conn.delete(key))
    }

    pub fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, PoolError> {
        self.execute(Verb::Incr, |conn| conn.incr(key, delta))
    }

    pub fn decr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, PoolError> {
        self.execute(Verb::Decr, |conn| conn.decr(key, delta))
    }

    pub fn touch(&mut self, key: &str, exptime: u32) -> Result<bool, PoolError> {
        self.execute(Verb::Touch, |conn| conn.touch(key, exptime))
    }

    pub fn stats(&mut self) -> Result<HashMap<String, String>, PoolError> {
        self.execute(Verb::Stats, |conn| conn.stats())
    }

    pub fn flush_all(&mut self) -> Result<(), PoolError> {
        self.execute(Verb::FlushAll, |conn| conn.flush_all())
    }

    pub fn version(&mut self) -> Result<String, PoolError> {
        self.execute(Verb::Version, |conn| conn.version())
    }

    pub fn verbosity(&mut self, level: u32) -> Result<(), PoolError> {
        self.execute(Verb::Verbosity, |conn| conn.verbosity(level))
    }
}

impl<C: Connector> Drop for ResilientClient<C> {
    fn drop(&mut self) {
        self.close();
    }
}
