//! Connection establishment with server failover

use super::connection::PoolError;
use crate::lb::ServerSelector;
use crate::protocol::{Connection, Connector, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Opens connections to whichever server the selector offers
///
/// A server that refuses the connection or does not answer within
/// `connect_timeout` is blacklisted, and the next candidate is tried. Any
/// other failure is returned at once, without blacklisting, since it says
/// nothing about reachability.
pub struct ConnectionFactory<C: Connector> {
    /// Builds unconnected clients
    connector: C,

    /// Shared server rotation and blacklist
    selector: Arc<ServerSelector>,

    /// Upper bound on a single connect attempt
    connect_timeout: Duration,
}

impl<C: Connector> ConnectionFactory<C> {
    /// Create a factory drawing servers from `selector`
    pub fn new(connector: C, selector: Arc<ServerSelector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            selector,
            connect_timeout,
        }
    }

    /// Open a connection to the next reachable server
    ///
    /// Fails with the last connectivity error once every server is
    /// blacklisted, or [`PoolError::NoServers`] if none could be tried.
    pub fn create(&self) -> Result<C::Conn, PoolError> {
        let mut last_err = None;

        // Each failure blacklists one server, so one pass over the list is
        // enough. The bound also stops a near-zero TTL from looping forever.
        for _ in 0..self.selector.addresses().len() {
            let Some(addr) = self.selector.pick() else {
                break;
            };

            let mut conn = self.connector.client(&addr);
            match conn.connect(self.connect_timeout) {
                Ok(()) | Err(ProtocolError::AlreadyConnected) => {
                    info!(addr = %addr, "Created new cache connection");
                    return Ok(conn);
                }
                Err(err) if err.is_connectivity() => {
                    warn!(addr = %addr, error = %err, "Cache server unreachable");
                    self.selector.blacklist(&addr);
                    last_err = Some(PoolError::Connect { addr, source: err });
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "Connection attempt failed");
                    return Err(PoolError::Connect { addr, source: err });
                }
            }
        }

        Err(last_err.unwrap_or(PoolError::NoServers))
    }

    /// The selector this factory draws servers from
    pub fn selector(&self) -> &Arc<ServerSelector> {
        &self.selector
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}
