//! Offline queue service: pending mutations plus a TTL cache for reads.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::StoreResult;
use super::storage::{QueueStorage, SqliteStorage};
use super::types::{CacheEntry, DeadLetter, Mutation, MutationKind, QueuedMutation};
use crate::clock::Clock;
use crate::db::StoreLocation;

/// Default time-to-live for cached read responses, in seconds.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 60 * 60;

/// Durable holder of writes awaiting the server.
///
/// Owns the pending partitions exclusively: records leave only through
/// [`OfflineQueue::mark_synced`], [`OfflineQueue::dead_letter`] or
/// [`OfflineQueue::clear`].
pub struct OfflineQueue {
  storage: Arc<dyn QueueStorage>,
  clock: Arc<dyn Clock>,
  default_ttl: Duration,
}

impl OfflineQueue {
  /// Build a queue over an already opened storage backend.
  pub fn new(storage: Arc<dyn QueueStorage>, clock: Arc<dyn Clock>) -> Self {
    Self {
      storage,
      clock,
      default_ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS),
    }
  }

  /// Open SQLite storage at `location` and build a queue over it.
  ///
  /// Fails with `StoreError::Unavailable` when the database cannot be opened;
  /// callers are expected to retry with [`StoreLocation::Memory`].
  pub fn initialize(location: &StoreLocation, clock: Arc<dyn Clock>) -> StoreResult<Self> {
    let storage = SqliteStorage::open(location)?;
    debug!(durable = storage.is_durable(), "Offline queue initialized");
    Ok(Self::new(Arc::new(storage), clock))
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Store a mutation under its kind, assigning an id when it has none.
  ///
  /// Reusing an id overwrites the earlier record.
  pub fn enqueue(&self, mut mutation: Mutation) -> StoreResult<QueuedMutation> {
    let id = match mutation.id() {
      Some(id) if !id.is_empty() => id.to_string(),
      _ => {
        let id = uuid::Uuid::new_v4().to_string();
        mutation.set_id(id.clone());
        id
      }
    };

    let mut queued = QueuedMutation {
      id,
      payload: mutation,
      enqueued_at: self.clock.now(),
      synced: false,
      attempts: 0,
      revision: 0,
    };
    queued.revision = self.storage.put_mutation(&queued)?;

    debug!(kind = %queued.kind(), id = %queued.id, revision = queued.revision, "Mutation enqueued");
    Ok(queued)
  }

  /// Every pending record of `kind`, regardless of age.
  pub fn list_pending(&self, kind: MutationKind) -> StoreResult<Vec<QueuedMutation>> {
    self.storage.list_mutations(kind)
  }

  /// The server accepted `mutation`; drop it from the queue.
  ///
  /// Returns false when the record was overwritten or removed after it was
  /// listed. A newer revision stays pending.
  pub fn mark_synced(&self, mutation: &QueuedMutation) -> StoreResult<bool> {
    self
      .storage
      .delete_mutation(mutation.kind(), &mutation.id, mutation.revision)
  }

  /// Count a failed submission. Returns the new attempt count, or None when
  /// the record was overwritten or removed after it was listed.
  pub fn record_failure(&self, mutation: &QueuedMutation) -> StoreResult<Option<u32>> {
    self
      .storage
      .bump_attempts(mutation.kind(), &mutation.id, mutation.revision)
  }

  /// Move `mutation` to the dead letters. Returns false, moving nothing, when
  /// the pending record is no longer at the same revision.
  pub fn dead_letter(&self, mutation: QueuedMutation, reason: impl Into<String>) -> StoreResult<bool> {
    let letter = DeadLetter {
      mutation,
      reason: reason.into(),
      dead_lettered_at: self.clock.now(),
    };
    let moved = self.storage.move_to_dead_letter(&letter)?;
    if moved {
      warn!(
        kind = %letter.mutation.kind(),
        id = %letter.mutation.id,
        attempts = letter.mutation.attempts,
        reason = %letter.reason,
        "Mutation moved to dead letters"
      );
    }
    Ok(moved)
  }

  pub fn list_dead_letters(&self, kind: MutationKind) -> StoreResult<Vec<DeadLetter>> {
    self.storage.list_dead_letters(kind)
  }

  /// Drop every pending record of `kind` without submitting it.
  pub fn clear(&self, kind: MutationKind) -> StoreResult<usize> {
    self.storage.clear_mutations(kind)
  }

  /// Cache `data` under `key` for `ttl` (default one hour).
  pub fn cache_put<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) -> StoreResult<()> {
    let stored_at = self.clock.now();
    let entry = CacheEntry {
      key: key.to_string(),
      data: serde_json::to_value(data)?,
      stored_at,
      expires_at: expiry(stored_at, ttl.unwrap_or(self.default_ttl)),
    };
    self.storage.put_cache_entry(&entry)
  }

  /// Cached value for `key`, or None if missing or expired.
  ///
  /// Expiry is checked here, not only by the sweep, so a stale value is
  /// never returned.
  pub fn cache_get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
    let Some(entry) = self.storage.get_cache_entry(key)? else {
      return Ok(None);
    };

    if entry.is_expired(self.clock.now()) {
      if let Err(e) = self.storage.delete_cache_entry(key) {
        debug!(key, error = %e, "Failed to delete expired cache entry");
      }
      return Ok(None);
    }

    Ok(Some(serde_json::from_value(entry.data)?))
  }

  /// Delete every expired cache entry. Returns how many were removed.
  pub fn cache_sweep(&self) -> StoreResult<usize> {
    let removed = self.storage.sweep_cache_entries(self.clock.now())?;
    if removed > 0 {
      debug!(removed, "Swept expired cache entries");
    }
    Ok(removed)
  }
}

/// `stored_at + ttl`, saturating at the representable range.
fn expiry(stored_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  match stored_at.checked_add_signed(ttl) {
    Some(expires_at) => expires_at,
    None if ttl < Duration::zero() => DateTime::<Utc>::MIN_UTC,
    None => DateTime::<Utc>::MAX_UTC,
  }
}
