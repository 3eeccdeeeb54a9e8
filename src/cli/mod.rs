//! CLI module for memcpool
//!
//! Thin commands over [`Cache`](crate::cache::Cache) for operating a
//! memcached cluster by hand. Every command goes through the same pool,
//! failover and retry path as library callers.
//!
//! # Usage
//!
//! ```bash
//! # Read and write values
//! memcpool --servers cache-1:11211,cache-2:11211 set greeting hello --ttl 300
//! memcpool --servers cache-1:11211,cache-2:11211 get greeting
//!
//! # Counters
//! memcpool --config memcpool.yaml --cluster sessions incr visits --by 5
//!
//! # Server state
//! memcpool stats
//! memcpool flush --force
//! ```

pub mod commands;

pub use commands::*;
