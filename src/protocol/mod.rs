//! Cache server client abstraction
//!
//! The pool and failover layers never speak the wire protocol themselves.
//! They drive any type implementing [`Connection`], created through a
//! [`Connector`]:
//!
//! - [`Connection`]: one client bound to one server, with the memcached verb surface
//! - [`Connector`]: builds unconnected clients for an address
//! - [`Verb`]: operation names, and which of them are safe to retry
//! - [`text`]: a blocking implementation of the memcached text protocol

pub mod text;
pub mod verb;

pub use text::{TextConnection, TextConnector};
pub use verb::{StoreMode, Verb};

use crate::lb::Address;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Error types for a single protocol exchange
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Server did not recognise the command")]
    UnknownCommand,

    /// A missing key reported as an error rather than a `None` result
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Item of {size} bytes exceeds the {max} byte limit")]
    ItemTooLarge { size: usize, max: usize },

    #[error("Connection is already established")]
    AlreadyConnected,

    #[error("Connection is in an invalid state")]
    InvalidState,
}

impl ProtocolError {
    /// Failures that leave the connection unusable
    ///
    /// The connection has to be rebuilt before another request can be sent.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::Protocol(_) | ProtocolError::ConnectionClosed
        )
    }

    /// Failures that mean the server could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        match self {
            ProtocolError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ),
            _ => false,
        }
    }
}

/// A stored value together with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Raw payload bytes
    pub value: Bytes,
    /// Opaque client flags stored alongside the value
    pub flags: u32,
    /// CAS token, present when fetched with `gets`
    pub cas: Option<u64>,
}

impl Item {
    pub fn new(value: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            value: value.into(),
            flags,
            cas: None,
        }
    }
}

/// Outcome of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    /// The value was replaced
    Stored,
    /// Someone modified the item since the token was read
    Exists,
    /// The item no longer exists
    NotFound,
}

/// A client bound to one cache server
///
/// A connection is created unconnected by its [`Connector`] and becomes
/// usable after [`connect`](Connection::connect) succeeds. It stays bound
/// to the same address for its whole lifetime.
pub trait Connection: Send + 'static {
    /// The server this connection talks to
    fn address(&self) -> &Address;

    /// Establish the connection, giving up after `timeout`
    ///
    /// Connecting an already connected client fails with
    /// [`ProtocolError::AlreadyConnected`].
    fn connect(&mut self, timeout: Duration) -> Result<(), ProtocolError>;

    /// Tear the connection down; never fails
    fn close(&mut self);

    /// Whether the connection currently holds an open socket
    fn is_connected(&self) -> bool;

    fn get(&mut self, key: &str) -> Result<Option<Item>, ProtocolError>;

    /// Like `get`, but the returned item carries a CAS token
    fn gets(&mut self, key: &str) -> Result<Option<Item>, ProtocolError>;

    /// Fetch several keys in one round trip; missing keys are omitted
    fn get_multi(&mut self, keys: &[&str]) -> Result<HashMap<String, Item>, ProtocolError>;

    /// Run a storage command; `false` means the server declined to store
    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<bool, ProtocolError>;

    fn cas(
        &mut self,
        key: &str,
        value: &[u8],
        flags: u32,
        exptime: u32,
        cas: u64,
    ) -> Result<CasResult, ProtocolError>;

    /// `false` when the key did not exist
    fn delete(&mut self, key: &str) -> Result<bool, ProtocolError>;

    /// `None` when the key did not exist
    ///
    /// Implementations that cannot distinguish a miss in the reply may
    /// instead fail with [`ProtocolError::KeyNotFound`]; callers treat both
    /// the same way.
    fn incr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError>;

    /// `None` when the key did not exist, or [`ProtocolError::KeyNotFound`]
    /// as for [`incr`](Connection::incr)
    fn decr(&mut self, key: &str, delta: u64) -> Result<Option<u64>, ProtocolError>;

    fn touch(&mut self, key: &str, exptime: u32) -> Result<bool, ProtocolError>;

    fn stats(&mut self) -> Result<HashMap<String, String>, ProtocolError>;

    fn flush_all(&mut self) -> Result<(), ProtocolError>;

    fn version(&mut self) -> Result<String, ProtocolError>;

    fn verbosity(&mut self, level: u32) -> Result<(), ProtocolError>;
}

/// Builds connections for a given server
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Create an unconnected client for `addr`
    fn client(&self, addr: &Address) -> Self::Conn;
}
