//! Network request interception over versioned response-cache partitions.
//!
//! Each GET request is routed to one discipline:
//! - API routes: network-first, falling back to the last good response and,
//!   for critical listings, to an empty offline placeholder
//! - Pre-enumerated static assets: cache-first
//! - Everything else: stale-while-revalidate
//!
//! Only successful network responses are ever written to a partition.

mod interceptor;
mod partitions;
mod strategy;

pub use interceptor::Interceptor;
pub use partitions::{CachePartitions, ResponseStore, SqliteResponseStore};
pub use strategy::Router;
