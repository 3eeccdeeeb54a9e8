//! Server selection for memcpool
//!
//! This module decides which cache server a new connection is opened to.
//!
//! # Components
//!
//! - [`Address`]: Identifies one cache server (`host:port`)
//! - [`ServerSelector`]: Round-robin selection with a temporary blacklist
//!
//! # Blacklisting
//!
//! When a connection attempt is refused or times out, the
//! [`ConnectionFactory`](crate::pool::ConnectionFactory) blacklists the
//! server. It stays out of rotation for the blacklist TTL, after which the
//! next pick notices the expired entry and makes the server eligible again.
//!
//! ```rust
//! use memcpool::lb::{Address, ServerSelector};
//! use std::time::Duration;
//!
//! let a: Address = "cache-1:11211".parse().unwrap();
//! let b: Address = "cache-2:11211".parse().unwrap();
//! let selector = ServerSelector::new(vec![a.clone(), b.clone()], Duration::from_secs(60));
//!
//! selector.blacklist(&a);
//! assert_eq!(selector.pick(), Some(b.clone()));
//! assert_eq!(selector.pick(), Some(b));
//! ```
//!
//! # Thread Safety
//!
//! The blacklist and rotation cursor live behind a single mutex. Every
//! critical section is short and never blocks on I/O.

pub mod address;
pub mod selector;

pub use address::{parse_addresses, Address, AddressError, DEFAULT_PORT};
pub use selector::ServerSelector;
