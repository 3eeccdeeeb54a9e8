//! Connection pooling with freshness-based eviction
//!
//! This module provides a blocking pool of [`ResilientClient`]s with:
//! - Optional fixed capacity, with a bounded wait when every slot is in use
//! - Eviction of connections older than the freshness window
//! - Guaranteed check-in through an RAII guard
//! - Creation failures surfaced to the caller

use super::factory::ConnectionFactory;
use super::resilient::{ResilientClient, RetryPolicy};
use crate::lb::Address;
use crate::protocol::{Connector, ProtocolError};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to cache server {addr}: {source}")]
    Connect {
        addr: Address,
        #[source]
        source: ProtocolError,
    },

    #[error("No cache servers available")]
    NoServers,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    CheckoutTimeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of connections the pool may hand out; `None` grows without bound
    pub max_size: Option<usize>,

    /// Maximum age of a pooled connection before it is replaced
    pub freshness_window: Duration,

    /// How long a checkout waits for a slot in a full pool
    pub checkout_timeout: Duration,

    /// Recovery policy for each pooled client
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(35),
            freshness_window: Duration::from_secs(60),
            checkout_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total connections created
    pub total_created: u64,

    /// Total checkouts served by an existing connection
    pub total_reused: u64,

    /// Connections closed because they outlived the freshness window
    pub discarded_stale: u64,

    /// Connections dropped for being broken or explicitly discarded
    pub discarded_broken: u64,

    /// Checkouts that found no connection could be created
    pub failed_attempts: u64,

    /// Checkouts that gave up waiting for a slot
    pub checkout_timeouts: u64,

    /// Connections currently checked out
    pub active_connections: usize,

    /// Live connections waiting in the pool
    pub idle_connections: usize,
}

/// One pool entry
///
/// Slots order live connections before placeholders, and older live
/// connections before newer ones, so the connection most likely to be
/// stale is always inspected first.
enum Slot<T> {
    /// A connection and the instant it was last validated
    Live { validated_at: Instant, client: T },
    /// Capacity not currently backed by a connection
    Empty,
}

impl<T> Slot<T> {
    fn sort_key(&self) -> (bool, Option<Instant>) {
        match self {
            Slot::Live { validated_at, .. } => (false, Some(*validated_at)),
            Slot::Empty => (true, None),
        }
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Slots plus statistics, guarded by the pool mutex
struct PoolState<C: Connector> {
    /// Min-heap of slots (smallest sort key pops first)
    slots: BinaryHeap<Reverse<Slot<ResilientClient<C>>>>,

    /// Pool statistics
    stats: PoolStats,
}

struct PoolInner<C: Connector> {
    factory: Arc<ConnectionFactory<C>>,
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    /// Signalled whenever a slot goes back into the pool
    available: Condvar,
}

/// Pool of resilient cache connections
///
/// Cloning the pool creates another handle to the same slots.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool that opens connections through `factory`
    ///
    /// A fixed-size pool starts with one placeholder per slot; connections
    /// are only opened on demand.
    pub fn new(factory: Arc<ConnectionFactory<C>>, config: PoolConfig) -> Self {
        let mut slots = BinaryHeap::new();
        if let Some(size) = config.max_size {
            slots.extend((0..size).map(|_| Reverse(Slot::Empty)));
        }

        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    slots,
                    stats: PoolStats::default(),
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Check a connection out of the pool
    ///
    /// Reuses a fresh pooled connection when one is available and opens a
    /// new one otherwise. A fixed-size pool with every slot in use waits up
    /// to `checkout_timeout`, then fails with [`PoolError::CheckoutTimeout`].
    pub fn reserve(&self) -> Result<PooledConnection<C>, PoolError> {
        loop {
            let slot = match self.inner.config.max_size {
                Some(_) => Some(self.wait_for_slot()?),
                None => self.lock().slots.pop().map(|Reverse(slot)| slot),
            };

            match slot {
                Some(Slot::Live {
                    validated_at,
                    mut client,
                }) => {
                    if self.is_fresh(validated_at) {
                        let mut state = self.lock();
                        state.stats.total_reused += 1;
                        state.stats.active_connections += 1;
                        debug!(
                            addr = ?client.address(),
                            age_secs = validated_at.elapsed().as_secs(),
                            "Reusing connection"
                        );
                        drop(state);
                        return Ok(PooledConnection::new(self.clone(), client, validated_at));
                    }

                    debug!(
                        addr = ?client.address(),
                        age_secs = validated_at.elapsed().as_secs(),
                        "Discarding stale connection"
                    );
                    client.close();
                    let mut state = self.lock();
                    state.stats.discarded_stale += 1;
                    if self.inner.config.max_size.is_some() {
                        state.slots.push(Reverse(Slot::Empty));
                    }
                }
                Some(Slot::Empty) => return self.create_connection(true),
                None => return self.create_connection(false),
            }
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let mut stats = state.stats.clone();
        stats.idle_connections = state
            .slots
            .iter()
            .filter(|Reverse(slot)| matches!(slot, Slot::Live { .. }))
            .count();
        stats
    }

    /// Fixed capacity of the pool, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.inner.config.max_size
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The factory used to open new connections
    pub fn factory(&self) -> &Arc<ConnectionFactory<C>> {
        &self.inner.factory
    }

    fn create_connection(&self, used_placeholder: bool) -> Result<PooledConnection<C>, PoolError> {
        let factory = Arc::clone(&self.inner.factory);
        match ResilientClient::connect(factory, self.inner.config.retry.clone()) {
            Ok(client) => {
                let mut state = self.lock();
                state.stats.total_created += 1;
                state.stats.active_connections += 1;
                drop(state);
                Ok(PooledConnection::new(self.clone(), client, Instant::now()))
            }
            Err(err) => {
                let mut state = self.lock();
                state.stats.failed_attempts += 1;
                // Hand the slot back so the pool keeps its full capacity
                if used_placeholder {
                    state.slots.push(Reverse(Slot::Empty));
                    drop(state);
                    self.inner.available.notify_one();
                }
                Err(err)
            }
        }
    }

    fn wait_for_slot(&self) -> Result<Slot<ResilientClient<C>>, PoolError> {
        let timeout = self.inner.config.checkout_timeout;
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(Reverse(slot)) = state.slots.pop() {
                return Ok(slot);
            }

            let now = Instant::now();
            if now >= deadline {
                state.stats.checkout_timeouts += 1;
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    active = state.stats.active_connections,
                    "Timed out waiting for a pooled connection"
                );
                return Err(PoolError::CheckoutTimeout(timeout));
            }

            state = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Return a connection, keeping it only if it is still fresh
    fn check_in(&self, mut client: ResilientClient<C>, validated_at: Instant) {
        let fresh = self.is_fresh(validated_at);
        let keep = fresh && client.is_connected();
        if !keep {
            debug!(addr = ?client.address(), fresh, "Closing connection on release");
            client.close();
        }

        let mut state = self.lock();
        state.stats.active_connections = state.stats.active_connections.saturating_sub(1);
        if keep {
            state.slots.push(Reverse(Slot::Live { validated_at, client }));
        } else {
            if fresh {
                state.stats.discarded_broken += 1;
            } else {
                state.stats.discarded_stale += 1;
            }
            // Unbounded pools never hold placeholders
            if self.inner.config.max_size.is_some() {
                state.slots.push(Reverse(Slot::Empty));
            }
        }
        drop(state);
        self.inner.available.notify_one();
    }

    fn retire(&self, mut client: ResilientClient<C>) {
        client.close();
        let mut state = self.lock();
        state.stats.active_connections = state.stats.active_connections.saturating_sub(1);
        state.stats.discarded_broken += 1;
        if self.inner.config.max_size.is_some() {
            state.slots.push(Reverse(Slot::Empty));
        }
        drop(state);
        self.inner.available.notify_one();
    }

    fn is_fresh(&self, validated_at: Instant) -> bool {
        validated_at.elapsed() <= self.inner.config.freshness_window
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection, returned to its pool when dropped
///
/// Dereferences to the [`ResilientClient`], so verbs are called directly
/// on the guard.
pub struct PooledConnection<C: Connector> {
    pool: ConnectionPool<C>,
    client: Option<ResilientClient<C>>,
    validated_at: Instant,
}

impl<C: Connector> PooledConnection<C> {
    fn new(pool: ConnectionPool<C>, client: ResilientClient<C>, validated_at: Instant) -> Self {
        Self {
            pool,
            client: Some(client),
            validated_at,
        }
    }

    /// When this connection was opened or last validated
    pub fn validated_at(&self) -> Instant {
        self.validated_at
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.retire(client);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("validated_at", &self.validated_at)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = ResilientClient<C>;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("pooled connection already released")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("pooled connection already released")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.check_in(client, self.validated_at);
        }
    }
}
