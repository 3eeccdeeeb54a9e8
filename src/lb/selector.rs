use super::address::Address;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Mutable selection state, guarded by the selector's mutex
#[derive(Debug, Default)]
struct SelectorState {
    /// When each unreachable address was last blacklisted
    blacklist: HashMap<Address, Instant>,
    /// Round-robin position within the eligible list
    cursor: usize,
}

/// Chooses which cache server the next connection goes to
///
/// Servers that refused a connection are blacklisted for `blacklist_ttl`.
/// Expired entries are purged lazily whenever a pick happens, so no
/// background task is needed.
#[derive(Debug)]
pub struct ServerSelector {
    /// Configured servers, in configuration order
    addresses: Vec<Address>,
    /// How long a blacklisted server stays excluded
    blacklist_ttl: Duration,
    /// Blacklist and rotation cursor
    state: Mutex<SelectorState>,
}

impl ServerSelector {
    /// Create a selector over the given servers
    pub fn new(addresses: Vec<Address>, blacklist_ttl: Duration) -> Self {
        Self {
            addresses,
            blacklist_ttl,
            state: Mutex::new(SelectorState::default()),
        }
    }

    /// Pick the next eligible server, or `None` if every server is blacklisted
    pub fn pick(&self) -> Option<Address> {
        let mut state = self.lock();
        self.purge_expired(&mut state);

        let eligible: Vec<&Address> = self
            .addresses
            .iter()
            .filter(|addr| !state.blacklist.contains_key(*addr))
            .collect();

        if eligible.is_empty() {
            warn!(
                servers = self.addresses.len(),
                "No eligible cache servers, all are blacklisted"
            );
            return None;
        }

        // Membership may have shrunk since the last pick
        if state.cursor >= eligible.len() {
            state.cursor = 0;
        }

        let picked = eligible[state.cursor].clone();
        state.cursor = (state.cursor + 1) % eligible.len();

        debug!(addr = %picked, eligible = eligible.len(), "Selected cache server");
        Some(picked)
    }

    /// Exclude a server from selection for the blacklist TTL
    ///
    /// Blacklisting an already blacklisted server restarts its timer.
    pub fn blacklist(&self, addr: &Address) {
        let mut state = self.lock();
        let previous = state.blacklist.insert(addr.clone(), Instant::now());
        warn!(
            addr = %addr,
            ttl_secs = self.blacklist_ttl.as_secs_f64(),
            renewed = previous.is_some(),
            "Blacklisted cache server"
        );
    }

    /// Check whether a server is currently blacklisted
    pub fn is_blacklisted(&self, addr: &Address) -> bool {
        let mut state = self.lock();
        self.purge_expired(&mut state);
        state.blacklist.contains_key(addr)
    }

    /// Servers that a pick could currently return, in configuration order
    pub fn eligible(&self) -> Vec<Address> {
        let mut state = self.lock();
        self.purge_expired(&mut state);
        self.addresses
            .iter()
            .filter(|addr| !state.blacklist.contains_key(*addr))
            .cloned()
            .collect()
    }

    /// Forget every blacklist entry
    pub fn clear_blacklist(&self) {
        let mut state = self.lock();
        if !state.blacklist.is_empty() {
            info!(cleared = state.blacklist.len(), "Cleared cache server blacklist");
            state.blacklist.clear();
        }
    }

    /// All configured servers
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// The configured blacklist TTL
    pub fn blacklist_ttl(&self) -> Duration {
        self.blacklist_ttl
    }

    fn purge_expired(&self, state: &mut SelectorState) {
        let now = Instant::now();
        let ttl = self.blacklist_ttl;
        state.blacklist.retain(|addr, since| {
            let expired = now.duration_since(*since) > ttl;
            if expired {
                info!(addr = %addr, "Blacklist entry expired, server eligible again");
            }
            !expired
        });
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        // The state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
