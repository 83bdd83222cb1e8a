//! Local durable queue for offline writes.
//!
//! This module keeps user writes that have not reached the server yet:
//! - One partition per mutation kind (task, asset, booking), keyed by id
//! - A dead-letter table for records that exhausted the retry cap
//! - A generic TTL cache for read responses, with expiry checked on every read
//!   and an optional sweep to bound storage growth

mod error;
mod queue;
mod storage;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use queue::{OfflineQueue, DEFAULT_CACHE_TTL_SECS};
pub use storage::open_or_memory;
pub use types::{Mutation, MutationKind, QueuedMutation};

pub(crate) use storage::from_millis;
